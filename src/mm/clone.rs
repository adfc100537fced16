//! Address-space cloning.
//!
//! Clones the attached process's user address space into an empty
//! destination process. Anonymous memory is first materialized into
//! sections; both sides then reach their private mappings through fresh
//! copy-on-write overlays over the same parents, and the source's private
//! pages fall back to demand-paged state so the next touch faults through
//! the overlay.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::paging::{self, PteFlags};
use crate::config::{PAGE_SIZE, PAGE_SHIFT};
use crate::ke::Process;
use crate::ke::process;
use crate::mm::section::{Overlay, Section};
use crate::mm::vad::{MappedObject, Vad, VadList};
use crate::mm::{self, pfn};
use crate::status::{KeStatus, Status};

/// Per-descriptor record of which pages were committed in the source, so
/// the destination can replicate the demand-paged state exactly.
struct CommitRecord {
	start_va: usize,
	size_pages: usize,
	committed_pages: Vec<u64>,
}

impl CommitRecord {
	fn new(start_va: usize, size_pages: usize) -> Self {
		Self {
			start_va,
			size_pages,
			committed_pages: alloc::vec![0; size_pages.div_ceil(64)],
		}
	}

	fn mark(&mut self, index: usize) {
		self.committed_pages[index / 64] |= 1 << (index % 64);
	}

	fn is_marked(&self, index: usize) -> bool {
		self.committed_pages[index / 64] & (1 << (index % 64)) != 0
	}
}

/// Step 1: every anonymous descriptor becomes a section holding its
/// resident pages, so it has a parent an overlay can wrap.
fn materialize_anonymous_memory(vad_list: &VadList) -> Status {
	let guard = vad_list.lock();

	vad_list.for_each(&guard, |vad| {
		if vad.mapped_object.is_some() {
			return Ok(());
		}

		let section = Section::create((vad.size_pages * PAGE_SIZE) as u64);

		for i in 0..vad.size_pages {
			let page_va = vad.start_va + (i << PAGE_SHIFT);
			let Some(pte_ptr) = paging::get_pte_location_check(page_va, false) else {
				continue;
			};

			let pte = unsafe { core::ptr::read_volatile(pte_ptr) };
			if pte.is_present() {
				debug_assert!(pte.flags().contains(PteFlags::FROM_PMM));
				let pfn = pte.pfn();

				// The section takes its own hold on the frame; the
				// mapping keeps the one it already has until teardown.
				pfn::page_add_reference(pfn);
				let offset_page = (vad.section_offset >> PAGE_SHIFT) + i as u64;
				if let Err(err) = section.adopt_page(offset_page, pfn) {
					pfn::free_physical_page(pfn);
					return Err(err);
				}
			}
		}

		vad.mapped_object = Some(MappedObject::Section(section));
		Ok(())
	})
}

/// Step 4 for one list: wrap every private descriptor's object in a fresh
/// overlay.
fn wrap_private_mappings_in_overlays(vad_list: &VadList) -> Status {
	let guard = vad_list.lock();

	vad_list.for_each(&guard, |vad| {
		if !vad.private {
			return Ok(());
		}

		let parent = vad
			.mapped_object
			.clone()
			.expect("private descriptors were materialized in step 1");
		let overlay = Overlay::create(parent);

		vad.mapped_object = Some(MappedObject::Overlay(overlay));
		vad.cow = true;
		Ok(())
	})
}

/// Backs the added overlays out of a list after a failure.
fn undo_overlays(vad_list: &VadList) {
	let guard = vad_list.lock();

	vad_list
		.for_each(&guard, |vad| {
			if !vad.private {
				return Ok(());
			}
			if let Some(MappedObject::Overlay(overlay)) = vad.mapped_object.clone() {
				vad.mapped_object = Some(overlay.parent().clone());
				vad.cow = false;
			}
			Ok::<(), crate::status::KeStatus>(())
		})
		.ok();
}

/// Step 4, source side: demote every resident private page to committed
/// demand-paged state; the next access faults through the overlay.
fn tear_down_private_pages(vad_list: &VadList) -> Status<Vec<CommitRecord>> {
	let guard = vad_list.lock();
	let mut records = Vec::new();

	vad_list.for_each(&guard, |vad| {
		let mut record = CommitRecord::new(vad.start_va, vad.size_pages);

		for i in 0..vad.size_pages {
			let page_va = vad.start_va + (i << PAGE_SHIFT);
			let Some(pte_ptr) = paging::get_pte_location_check(page_va, false) else {
				if vad.committed {
					record.mark(i);
				}
				continue;
			};

			let pte = unsafe { core::ptr::read_volatile(pte_ptr) };

			if vad.committed || pte.flags().contains(PteFlags::COMMITTED) || pte.is_present() {
				record.mark(i);
			}

			if vad.private && pte.is_present() {
				unsafe {
					core::ptr::write_volatile(
						pte_ptr,
						paging::Pte::from_bits(PteFlags::COMMITTED.bits()),
					);
				}
				if pte.flags().contains(PteFlags::FROM_PMM) {
					pfn::free_physical_page(pte.pfn());
				}
			}
		}

		if vad.private {
			mm::issue_tlb_shootdown(vad.start_va, vad.size_pages * PAGE_SIZE);
		}

		records.push(record);
		Ok(())
	})?;

	Ok(records)
}

/// Clones the attached process's address space into `dest`.
///
/// `dest` must be freshly created: no threads, no descriptors. On failure
/// everything cloned so far is undone; the source keeps its overlays
/// backed out.
pub fn clone_address_space(dest: &Arc<Process>) -> Status {
	let source = process::attached_process();

	if Arc::ptr_eq(&source, dest) {
		return Err(KeStatus::InvalidParameter);
	}

	let source_base = crate::config::USER_SPACE_BASE;
	let source_ipl = mm::lock_space_exclusive(source_base);

	let result = clone_locked(&source, dest);

	mm::unlock_space(source_ipl, source_base);
	result
}

fn clone_locked(source: &Arc<Process>, dest: &Arc<Process>) -> Status {
	{
		let dest_guard = dest.vad_list.lock();
		if dest.has_threads() || !dest.vad_list.is_empty(&dest_guard) {
			return Err(KeStatus::InvalidParameter);
		}
	}

	// Step 1.
	materialize_anonymous_memory(&source.vad_list)?;

	// Step 2: the free-space layout and the descriptors themselves. The
	// cloned descriptors share the mapped objects, which is also step 3:
	// every destination descriptor holds its own object reference.
	source.heap.clone_into(&dest.heap)?;

	let copies: Vec<Vad> = {
		let guard = source.vad_list.lock();
		let mut copies = Vec::new();
		source.vad_list.for_each(&guard, |vad| {
			copies.push(Vad {
				start_va: vad.start_va,
				size_pages: vad.size_pages,
				committed: vad.committed,
				private: vad.private,
				cow: vad.cow,
				protection: vad.protection,
				mapped_object: vad.mapped_object.clone(),
				section_offset: vad.section_offset,
			});
			Ok(())
		})?;
		copies
	};

	{
		let dest_guard = dest.vad_list.lock();
		for vad in copies {
			if let Err(err) = dest.vad_list.insert(vad, &dest_guard) {
				drop(dest_guard);
				unwind_destination(dest);
				return Err(err);
			}
		}
	}

	// Step 4: both sides wrap their private mappings in fresh overlays
	// over the shared parents; the source's resident private pages fall
	// back to committed software PTEs.
	if let Err(err) = wrap_private_mappings_in_overlays(&source.vad_list) {
		undo_overlays(&source.vad_list);
		unwind_destination(dest);
		return Err(err);
	}
	if let Err(err) = wrap_private_mappings_in_overlays(&dest.vad_list) {
		undo_overlays(&source.vad_list);
		unwind_destination(dest);
		return Err(err);
	}

	let records = match tear_down_private_pages(&source.vad_list) {
		Ok(records) => records,
		Err(err) => {
			undo_overlays(&source.vad_list);
			unwind_destination(dest);
			return Err(err);
		}
	};

	// Step 5: replicate the committed state into the destination's PTEs.
	let current = crate::ke::current_thread();
	let previous = current.set_attached_process(Some(dest.clone()));

	let result = (|| {
		for record in &records {
			for i in 0..record.size_pages {
				if !record.is_marked(i) {
					continue;
				}

				let page_va = record.start_va + (i << PAGE_SHIFT);
				let pte_ptr = paging::get_pte_location_check(page_va, true)
					.ok_or(KeStatus::InsufficientMemory)?;
				unsafe {
					core::ptr::write_volatile(
						pte_ptr,
						paging::Pte::from_bits(PteFlags::COMMITTED.bits()),
					);
				}
			}
		}
		Ok(())
	})();

	current.set_attached_process(previous);

	if result.is_err() {
		unwind_destination(dest);
	}
	result
}

/// Frees everything cloned into `dest` so far.
fn unwind_destination(dest: &Arc<Process>) {
	let guard = dest.vad_list.lock();
	for start_va in dest.vad_list.start_addresses(&guard) {
		dest.vad_list.remove(start_va, &guard);
	}
	drop(guard);
	dest.heap.reset();
}
