//! Mapped views.
//!
//! `map_view_of_object` wires a mappable object into a process's address
//! space through a descriptor; the fault handler does the rest. System
//! space has its own window for file views — used by the cached read
//! path — indexed per FCB by section offset and recycled through a global
//! least-recently-used list.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use free_list::{FreeList, PageLayout, PageRange};
use hermit_sync::InterruptTicketMutex;

use crate::arch::paging;
use crate::config::{PAGE_SIZE, PAGE_SHIFT, VIEW_CACHE_MAX, VIEW_SPACE_BASE, VIEW_SPACE_SIZE};
use crate::io::file::FileObject;
use crate::ke::Process;
use crate::mm::vad::{MappedObject, Vad, VadList};
use crate::mm::{self, AllocationType, Protection};
use crate::status::{KeStatus, Status};

const FREE_LIST_INLINE_SIZE: usize = 16;

static VIEW_SPACE: InterruptTicketMutex<FreeList<FREE_LIST_INLINE_SIZE>> =
	InterruptTicketMutex::new(FreeList::new());

/// Descriptors of every system-space view; the kernel-space analog of a
/// process's descriptor list.
static SYSTEM_VAD_LIST: VadList = VadList::new();

/// System-space views, least recently mapped first.
static VIEW_LRU: InterruptTicketMutex<VecDeque<usize>> = InterruptTicketMutex::new(VecDeque::new());

pub(crate) fn init() {
	unsafe {
		VIEW_SPACE
			.lock()
			.deallocate(PageRange::new(VIEW_SPACE_BASE, VIEW_SPACE_BASE + VIEW_SPACE_SIZE).unwrap())
			.unwrap();
	}
}

pub(crate) fn system_vad_list() -> &'static VadList {
	&SYSTEM_VAD_LIST
}

/// Maps a view of `object` into `process`.
///
/// The returned address preserves the sub-page bits of `section_offset`,
/// so a byte offset into the object maps to the same byte in the view.
pub fn map_view_of_object(
	process: &Arc<Process>,
	object: MappedObject,
	size_pages: usize,
	allocation_type: AllocationType,
	section_offset: u64,
	protection: Protection,
) -> Status<usize> {
	if size_pages == 0 {
		return Err(KeStatus::InvalidParameter);
	}

	let top_down = allocation_type.contains(AllocationType::TOP_DOWN);
	let start_va = process.heap.allocate(size_pages, top_down)?;

	let cow = allocation_type.contains(AllocationType::COW);
	let vad = Vad {
		start_va,
		size_pages,
		committed: true,
		private: cow,
		cow,
		protection,
		section_offset: align_down!(section_offset, PAGE_SIZE as u64),
		mapped_object: Some(object),
	};

	let guard = process.vad_list.lock();
	if let Err(err) = process.vad_list.insert(vad, &guard) {
		drop(guard);
		process.heap.free(start_va, size_pages).ok();
		return Err(err);
	}

	Ok(start_va + (section_offset as usize & (PAGE_SIZE - 1)))
}

/// Unmaps the view at `va` from `process`.
pub fn unmap_view_of_object(process: &Arc<Process>, va: usize) -> Status {
	super::services::release_virtual_memory(process, align_down!(va, PAGE_SIZE))
}

/// Maps `size_pages` of `file` starting at `section_offset` into the
/// system view window, evicting stale views when the cache is over its
/// cap. Returns the view base.
pub fn map_view_of_file_in_system_space(
	file: &Arc<FileObject>,
	section_offset: u64,
	size_pages: usize,
) -> Status<usize> {
	if size_pages == 0 {
		return Err(KeStatus::InvalidParameter);
	}

	let fcb = &file.fcb;

	// Reuse an existing window over the same range if one survives.
	{
		let _guard = fcb.view_mutex.guard();
		if let Some(&va) = fcb.view_tree.borrow().get(&section_offset) {
			return Ok(va);
		}
	}

	purge_views_over_limit(1);

	let range = VIEW_SPACE
		.lock()
		.allocate(PageLayout::from_size_align(size_pages << PAGE_SHIFT, PAGE_SIZE).unwrap())
		.map_err(|_| KeStatus::InsufficientMemory)?;
	let start_va = range.start();

	let vad = Vad {
		start_va,
		size_pages,
		committed: true,
		private: false,
		cow: false,
		protection: Protection::READ | Protection::WRITE,
		section_offset: align_down!(section_offset, PAGE_SIZE as u64),
		mapped_object: Some(MappedObject::File(file.clone())),
	};

	let guard = SYSTEM_VAD_LIST.lock();
	if let Err(err) = SYSTEM_VAD_LIST.insert(vad, &guard) {
		drop(guard);
		unsafe {
			VIEW_SPACE.lock().deallocate(range).ok();
		}
		return Err(err);
	}
	drop(guard);

	{
		let _guard = fcb.view_mutex.guard();
		fcb.view_tree.borrow_mut().insert(section_offset, start_va);
	}
	VIEW_LRU.lock().push_back(start_va);

	Ok(start_va)
}

/// Unmaps a system-space file view by its base address.
pub fn unmap_view_of_file_in_system_space(va: usize) -> Status {
	let old_ipl = mm::lock_space_exclusive(va);

	let result = (|| {
		let guard = SYSTEM_VAD_LIST.lock();
		let vad = SYSTEM_VAD_LIST
			.remove(va, &guard)
			.ok_or(KeStatus::ConflictingAddresses)?;
		drop(guard);

		if let Some(MappedObject::File(file)) = &vad.mapped_object {
			let _guard = file.fcb.view_mutex.guard();
			file.fcb.view_tree.borrow_mut().remove(&vad.section_offset);
		}
		VIEW_LRU.lock().retain(|&queued| queued != va);

		paging::unmap_pages(vad.start_va, vad.size_pages, true);
		paging::free_unused_mapping_levels_in_current_map(
			vad.start_va,
			vad.size_pages * PAGE_SIZE,
		);
		mm::issue_tlb_shootdown(vad.start_va, vad.size_pages * PAGE_SIZE);

		unsafe {
			VIEW_SPACE
				.lock()
				.deallocate(
					PageRange::new(vad.start_va, vad.start_va + (vad.size_pages << PAGE_SHIFT))
						.unwrap(),
				)
				.ok();
		}

		Ok(())
	})();

	mm::unlock_space(old_ipl, va);
	result
}

/// Evicts least-recently-mapped system views until `incoming` more fit
/// under the cap.
pub fn purge_views_over_limit(incoming: usize) {
	loop {
		let victim = {
			let mut lru = VIEW_LRU.lock();
			if lru.len() + incoming <= VIEW_CACHE_MAX {
				return;
			}
			lru.pop_front()
		};

		let Some(va) = victim else {
			return;
		};

		if let Err(err) = unmap_view_of_file_in_system_space(va) {
			warn!("failed to evict the view at {va:#x}: {err}");
			return;
		}
	}
}
