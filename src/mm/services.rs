//! Virtual-memory services: reserve, commit, decommit, release.
//!
//! These manipulate a process's address descriptors and software PTEs;
//! pages themselves materialize later, in the fault handler, on first
//! touch.

use alloc::sync::Arc;

use crate::arch::paging::{self, PteFlags};
use crate::config::{PAGE_SIZE, PAGE_SHIFT};
use crate::ke::Process;
use crate::mm::vad::Vad;
use crate::mm::{self, AllocationType, Protection};
use crate::status::{KeStatus, Status};

/// Reserves `size_pages` of address space in `process` and creates the
/// descriptor for it. Returns the base address.
pub fn reserve_virtual_memory(
	process: &Arc<Process>,
	size_pages: usize,
	allocation_type: AllocationType,
	protection: Protection,
) -> Status<usize> {
	if size_pages == 0 {
		return Err(KeStatus::InvalidParameter);
	}

	let top_down = allocation_type.contains(AllocationType::TOP_DOWN);
	let start_va = process.heap.allocate(size_pages, top_down)?;

	let vad = Vad {
		start_va,
		size_pages,
		committed: allocation_type.contains(AllocationType::COMMIT),
		private: !allocation_type.contains(AllocationType::SHARED),
		cow: allocation_type.contains(AllocationType::COW),
		protection,
		mapped_object: None,
		section_offset: 0,
	};

	let guard = process.vad_list.lock();
	if let Err(err) = process.vad_list.insert(vad, &guard) {
		drop(guard);
		process.heap.free(start_va, size_pages).ok();
		return Err(err);
	}

	Ok(start_va)
}

/// Commits `size_pages` at `va`: every page inside a descriptor that
/// allows committing gets a `COMMITTED` software PTE, making it demand
/// paged.
pub fn commit_virtual_memory(va: usize, size_pages: usize) -> Status {
	let process = crate::ke::process::attached_process();
	let old_ipl = mm::lock_space_exclusive(va);

	let result = (|| {
		let guard = process.vad_list.lock();
		let covered = process
			.vad_list
			.with_vad_at(va, &guard, |vad| (vad.start_va, vad.end_va()))
			.ok_or(KeStatus::ConflictingAddresses)?;
		if va + size_pages * PAGE_SIZE > covered.1 {
			return Err(KeStatus::ConflictingAddresses);
		}
		drop(guard);

		for i in 0..size_pages {
			let page_va = va + (i << PAGE_SHIFT);
			let pte_ptr = paging::get_pte_location_check(page_va, true)
				.ok_or(KeStatus::InsufficientMemory)?;
			unsafe {
				let mut pte = core::ptr::read_volatile(pte_ptr);
				if !pte.is_present() {
					pte.remove(PteFlags::DECOMMITTED);
					pte.insert(PteFlags::COMMITTED);
					core::ptr::write_volatile(pte_ptr, pte);
				}
			}
		}

		Ok(())
	})();

	mm::unlock_space(old_ipl, va);
	result
}

/// Decommits `size_pages` at `va`: present anonymous pages are unmapped
/// and freed, software PTEs become `DECOMMITTED`, and empty page-table
/// levels go back to the allocator.
pub fn decommit_virtual_memory(va: usize, size_pages: usize) -> Status {
	let old_ipl = mm::lock_space_exclusive(va);

	for i in 0..size_pages {
		let page_va = va + (i << PAGE_SHIFT);
		let Some(pte_ptr) = paging::get_pte_location_check(page_va, false) else {
			continue;
		};

		unsafe {
			let pte = core::ptr::read_volatile(pte_ptr);
			if pte.is_present() {
				paging::unmap_pages(page_va, 1, true);
			}
			core::ptr::write_volatile(
				pte_ptr,
				paging::Pte::from_bits(PteFlags::DECOMMITTED.bits()),
			);
		}
	}

	paging::free_unused_mapping_levels_in_current_map(va, size_pages * PAGE_SIZE);
	mm::issue_tlb_shootdown(va, size_pages * PAGE_SIZE);

	mm::unlock_space(old_ipl, va);
	Ok(())
}

/// Releases the descriptor starting exactly at `va`: tears down resident
/// pages, removes the descriptor, and returns the range to the heap.
pub fn release_virtual_memory(process: &Arc<Process>, va: usize) -> Status {
	let old_ipl = mm::lock_space_exclusive(va);

	let result = (|| {
		let guard = process.vad_list.lock();
		let vad = process
			.vad_list
			.remove(va, &guard)
			.ok_or(KeStatus::ConflictingAddresses)?;
		drop(guard);

		// Resident pages go back to the allocator (anonymous) or drop
		// their object reference (mapped, via FROM_PMM accounting).
		paging::unmap_pages(vad.start_va, vad.size_pages, true);

		// Clear leftover software PTEs so a later reservation of the
		// same range starts clean.
		for i in 0..vad.size_pages {
			if let Some(pte_ptr) =
				paging::get_pte_location_check(vad.start_va + (i << PAGE_SHIFT), false)
			{
				unsafe {
					core::ptr::write_volatile(pte_ptr, paging::Pte::ZERO);
				}
			}
		}

		paging::free_unused_mapping_levels_in_current_map(
			vad.start_va,
			vad.size_pages * PAGE_SIZE,
		);
		mm::issue_tlb_shootdown(vad.start_va, vad.size_pages * PAGE_SIZE);

		process.heap.free(vad.start_va, vad.size_pages)?;
		// The descriptor's object reference, if any, drops here with it.
		Ok(())
	})();

	mm::unlock_space(old_ipl, va);
	result
}
