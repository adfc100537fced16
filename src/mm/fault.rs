//! The page-fault handler.
//!
//! The trap side funnels every fault into [`page_fault`], which retries
//! internally: `Refault` loops straight back in, `RefaultSleep` parks the
//! thread briefly so memory can drain before the retry. Everything else
//! surfaces to the trap handler, which either terminates the faulting
//! user thread or stops the system.

use alloc::sync::Arc;

use crate::arch::paging::{self, Pte, PteFlags};
use crate::config::{KERNEL_SPACE_BASE, PAGE_SIZE, PAGE_SHIFT, REFAULT_SLEEP_MS};
use crate::ke::Timer;
use crate::ke::ipl::Ipl;
use crate::ke::process;
use crate::ke::wait::wait_for_single;
use crate::mm::pfn::{self, Pfn};
use crate::mm::vad::{MappedObject, VadList};
use crate::mm::{self, FaultMode, Protection, hhdm_addr, mpw};
use crate::status::{KeStatus, Status};

/// Everything the fault paths need to know about the covering descriptor,
/// captured under the descriptor-list mutex and used after it is dropped.
struct VadSnapshot {
	start_va: usize,
	committed: bool,
	cow: bool,
	protection: Protection,
	section_offset: u64,
	mapped_object: Option<MappedObject>,
}

fn snapshot_vad(va: usize) -> Option<VadSnapshot> {
	let capture = |vad: &mut crate::mm::vad::Vad| VadSnapshot {
		start_va: vad.start_va,
		committed: vad.committed,
		cow: vad.cow,
		protection: vad.protection,
		section_offset: vad.section_offset,
		mapped_object: vad.mapped_object.clone(),
	};

	// Kernel-space descriptors (system views) live in one global list;
	// everything else belongs to the attached process.
	if va >= KERNEL_SPACE_BASE {
		let list: &VadList = mm::view::system_vad_list();
		let guard = list.lock();
		list.with_vad_at(va, &guard, capture)
	} else {
		let process = process::attached_process();
		let guard = process.vad_list.lock();
		process.vad_list.with_vad_at(va, &guard, capture)
	}
}

/// Leaf PTE bits for a materialized page of `vad`.
fn materialized_pte(vad: &VadSnapshot, va: usize, pfn: Pfn) -> Pte {
	let mut flags = PteFlags::PRESENT | PteFlags::FROM_PMM;

	if va < KERNEL_SPACE_BASE {
		flags.insert(PteFlags::USER_ACCESSIBLE);
	}
	if !vad.protection.contains(Protection::EXECUTE) {
		flags.insert(PteFlags::EXECUTE_DISABLE);
	}
	if vad.cow {
		flags.insert(PteFlags::COW);
	} else if vad.protection.contains(Protection::WRITE) {
		flags.insert(PteFlags::WRITABLE);
	}

	Pte::new(pfn.address() as u64, flags)
}

/// Entry point; runs at the IPL the fault arrived at.
pub fn page_fault(fault_pc: usize, fault_va: usize, mode: FaultMode) -> Status {
	loop {
		match page_fault_once(fault_va, mode) {
			Err(KeStatus::Refault) => continue,
			Err(KeStatus::RefaultSleep) => {
				// Out of memory: poke the modified-page writer, nap, and
				// try again once something drained.
				trace!("refault sleep at {fault_va:#x} (pc {fault_pc:#x})");
				mpw::signal();

				let timer = Arc::new(Timer::new());
				timer.set(REFAULT_SLEEP_MS, None);
				wait_for_single(&*timer, false, None)?;
				continue;
			}
			other => return other,
		}
	}
}

fn page_fault_once(fault_va: usize, mode: FaultMode) -> Status {
	debug_assert!(crate::ke::ipl::current() <= Ipl::Apc);

	let old_ipl = mm::lock_space_exclusive(fault_va);

	let pte_ptr = paging::get_pte_location_check(fault_va, false);
	if let Some(pte_ptr) = pte_ptr {
		let pte = unsafe { core::ptr::read_volatile(pte_ptr) };
		if pte.is_present() {
			if pte.flags().contains(PteFlags::WRITABLE) {
				// Resolved by somebody else already; the fault is stale.
				mm::unlock_space(old_ipl, fault_va);
				return Ok(());
			}

			if mode.contains(FaultMode::WRITE) {
				let result = write_fault(fault_va, pte_ptr);
				mm::unlock_space(old_ipl, fault_va);
				return result;
			}

			mm::unlock_space(old_ipl, fault_va);
			return Ok(());
		}
	}

	// Missing or software PTE.
	let result = normal_fault(fault_va, pte_ptr, old_ipl);

	if result.is_ok() && mode.contains(FaultMode::WRITE) {
		// The page came in, but possibly read-only; going around again
		// promotes it through the write-fault path.
		return Err(KeStatus::Refault);
	}

	result
}

/// Materializes a missing page. The space lock is held on entry and
/// released on every path out.
fn normal_fault(fault_va: usize, pte_ptr: Option<*mut Pte>, old_ipl: Ipl) -> Status {
	let Some(vad) = snapshot_vad(fault_va) else {
		mm::unlock_space(old_ipl, fault_va);
		return Err(KeStatus::AccessViolation);
	};

	let pte_committed = pte_ptr
		.map(|ptr| {
			let pte = unsafe { core::ptr::read_volatile(ptr) };
			pte.flags().contains(PteFlags::COMMITTED)
		})
		.unwrap_or(false);

	if !vad.committed && !pte_committed {
		mm::unlock_space(old_ipl, fault_va);
		return Err(KeStatus::AccessViolation);
	}

	let pte_ptr = match pte_ptr.or_else(|| paging::get_pte_location_check(fault_va, true)) {
		Some(ptr) => ptr,
		None => {
			mm::unlock_space(old_ipl, fault_va);
			return Err(KeStatus::RefaultSleep);
		}
	};

	match &vad.mapped_object {
		None => {
			let result = materialize_anonymous(&vad, fault_va, pte_ptr);
			mm::unlock_space(old_ipl, fault_va);
			result
		}
		Some(MappedObject::File(file)) => {
			let file = file.clone();
			mapped_file_fault(&vad, file, fault_va, pte_ptr, old_ipl)
		}
		Some(object) => {
			// Sections and overlays materialize without I/O; the space
			// lock stays held throughout.
			let offset_page = page_offset_in_object(&vad, fault_va);
			let result = object.mappable().get_page(offset_page).map(|pfn| unsafe {
				core::ptr::write_volatile(pte_ptr, materialized_pte(&vad, fault_va, pfn));
			});
			mm::unlock_space(old_ipl, fault_va);
			result
		}
	}
}

fn page_offset_in_object(vad: &VadSnapshot, va: usize) -> u64 {
	let page_va = align_down!(va, PAGE_SIZE);
	((page_va - vad.start_va) as u64 + vad.section_offset) >> PAGE_SHIFT
}

fn materialize_anonymous(vad: &VadSnapshot, fault_va: usize, pte_ptr: *mut Pte) -> Status {
	let Some(pfn) = pfn::allocate_physical_page() else {
		return Err(KeStatus::RefaultSleep);
	};

	// Fresh anonymous memory must read as zero.
	unsafe {
		core::ptr::write_bytes(hhdm_addr(pfn.address()) as *mut u8, 0, PAGE_SIZE);
		core::ptr::write_volatile(pte_ptr, materialized_pte(vad, fault_va, pfn));
	}

	Ok(())
}

/// Resolves a fault on a file-backed view, dropping the space lock while
/// the paging read is in flight.
fn mapped_file_fault(
	vad: &VadSnapshot,
	file: Arc<crate::io::file::FileObject>,
	fault_va: usize,
	pte_ptr: *mut Pte,
	old_ipl: Ipl,
) -> Status {
	let offset_page = page_offset_in_object(vad, fault_va);

	// Fast path: the page is already resident in the cache; the weak
	// cache hold is upgraded under the frame-database lock.
	if let Some(pfn) = file.cached_page(offset_page) {
		unsafe {
			core::ptr::write_volatile(pte_ptr, materialized_pte(vad, fault_va, pfn));
		}
		mm::unlock_space(old_ipl, fault_va);
		return Ok(());
	}

	// Slow path: the read may block, so the address space must stay
	// usable in the meantime.
	mm::unlock_space(old_ipl, fault_va);

	let pfn = file.page_in(offset_page).map_err(|err| match err {
		// Hard read failures are the faulting thread's problem, not a
		// reason to retry forever.
		KeStatus::Refault | KeStatus::RefaultSleep => err,
		_ => KeStatus::AccessViolation,
	})?;

	let old_ipl = mm::lock_space_exclusive(fault_va);

	// The world may have moved while the I/O ran.
	let Some(pte_ptr) = paging::get_pte_location_check(fault_va, true) else {
		mm::unlock_space(old_ipl, fault_va);
		pfn::free_physical_page(pfn);
		return Err(KeStatus::RefaultSleep);
	};

	let pte = unsafe { core::ptr::read_volatile(pte_ptr) };
	if pte.is_present() {
		// Another CPU resolved the fault during our read; discard the
		// speculative frame.
		pfn::free_physical_page(pfn);
		mm::unlock_space(old_ipl, fault_va);
		return Ok(());
	}

	unsafe {
		core::ptr::write_volatile(pte_ptr, materialized_pte(vad, fault_va, pfn));
	}
	mm::unlock_space(old_ipl, fault_va);
	Ok(())
}

/// Resolves a write to a read-only page: legitimate only through the
/// copy-on-write protocol.
fn write_fault(fault_va: usize, pte_ptr: *mut Pte) -> Status {
	let pte = unsafe { core::ptr::read_volatile(pte_ptr) };

	if !pte.flags().contains(PteFlags::COW) {
		return Err(KeStatus::AccessViolation);
	}

	let vad = snapshot_vad(fault_va).ok_or(KeStatus::AccessViolation)?;
	let offset_page = page_offset_in_object(&vad, fault_va);

	if let Some(object) = &vad.mapped_object {
		// Let the object diverge the page (overlays copy the parent's
		// bytes; files mark the page dirty), then swap the mapping to
		// whatever the object now considers current.
		object.mappable().prepare_write(offset_page)?;
		let new_pfn = object.mappable().get_page(offset_page)?;

		let old_pfn = pte.pfn();
		if new_pfn == old_pfn {
			// Same frame: promote the mapping in place and drop the
			// extra reference the lookup took.
			pfn::free_physical_page(new_pfn);
			unsafe {
				let mut new_pte = pte;
				new_pte.remove(PteFlags::COW);
				new_pte.insert(PteFlags::WRITABLE);
				core::ptr::write_volatile(pte_ptr, new_pte);
			}
		} else {
			unsafe {
				let mut new_pte = pte;
				new_pte.remove(PteFlags::COW);
				new_pte.insert(PteFlags::WRITABLE);
				new_pte.set_address(new_pfn.address() as u64);
				core::ptr::write_volatile(pte_ptr, new_pte);
			}
			if pte.flags().contains(PteFlags::FROM_PMM) {
				pfn::free_physical_page(old_pfn);
			}
		}

		mm::issue_tlb_shootdown(align_down!(fault_va, PAGE_SIZE), PAGE_SIZE);
		return Ok(());
	}

	// Plain anonymous copy-on-write: a frame shared with nobody promotes
	// in place, anything else gets copied.
	let old_pfn = pte.pfn();
	let shared = pfn::with_database(|db| db.reference_count(old_pfn) > 1);

	if !shared {
		unsafe {
			let mut new_pte = pte;
			new_pte.remove(PteFlags::COW);
			new_pte.insert(PteFlags::WRITABLE);
			core::ptr::write_volatile(pte_ptr, new_pte);
		}
	} else {
		let Some(new_pfn) = pfn::allocate_physical_page() else {
			return Err(KeStatus::RefaultSleep);
		};

		unsafe {
			core::ptr::copy_nonoverlapping(
				hhdm_addr(old_pfn.address()) as *const u8,
				hhdm_addr(new_pfn.address()) as *mut u8,
				PAGE_SIZE,
			);

			let mut new_pte = pte;
			new_pte.remove(PteFlags::COW);
			new_pte.insert(PteFlags::WRITABLE);
			new_pte.set_address(new_pfn.address() as u64);
			core::ptr::write_volatile(pte_ptr, new_pte);
		}

		pfn::free_physical_page(old_pfn);
	}

	mm::issue_tlb_shootdown(align_down!(fault_va, PAGE_SIZE), PAGE_SIZE);
	Ok(())
}
