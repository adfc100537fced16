//! The kernel pool's address-space layer.
//!
//! Small allocations come from the global heap; page-granular pool space
//! comes from a dedicated system window. Every pool-space allocation is
//! preceded by an unmapped guard page whose software PTE carries the
//! `IS_POOL_HEADER` bit and the index of the allocation's bookkeeping
//! entry, so the entry is recoverable from the allocation base with one
//! PTE read.

use alloc::vec::Vec;

use free_list::{FreeList, PageLayout, PageRange};
use hermit_sync::InterruptTicketMutex;

use crate::arch::paging::{self, Pte, PteFlags};
use crate::config::{PAGE_SIZE, PAGE_SHIFT, POOL_SPACE_BASE, POOL_SPACE_SIZE};
use crate::mm::{self, Protection};
use crate::status::{KeStatus, Status};

const FREE_LIST_INLINE_SIZE: usize = 16;

static POOL_SPACE: InterruptTicketMutex<FreeList<FREE_LIST_INLINE_SIZE>> =
	InterruptTicketMutex::new(FreeList::new());

/// Bookkeeping for one pool-space allocation.
#[derive(Debug, Clone, Copy)]
pub struct PoolSpaceEntry {
	/// First data page (the guard page sits just below).
	pub base: usize,
	pub size_pages: usize,
}

static POOL_ENTRIES: InterruptTicketMutex<Vec<Option<PoolSpaceEntry>>> =
	InterruptTicketMutex::new(Vec::new());

pub(crate) fn init() {
	unsafe {
		POOL_SPACE
			.lock()
			.deallocate(PageRange::new(POOL_SPACE_BASE, POOL_SPACE_BASE + POOL_SPACE_SIZE).unwrap())
			.unwrap();
	}
}

fn register_entry(entry: PoolSpaceEntry) -> usize {
	let mut entries = POOL_ENTRIES.lock();
	if let Some(index) = entries.iter().position(Option::is_none) {
		entries[index] = Some(entry);
		index
	} else {
		entries.push(Some(entry));
		entries.len() - 1
	}
}

/// Allocates `size_pages` of mapped pool space. Returns the base address
/// of the data pages.
pub fn allocate_pool_space(size_pages: usize) -> Status<usize> {
	if size_pages == 0 {
		return Err(KeStatus::InvalidParameter);
	}

	// One extra page for the guard.
	let total_bytes = (size_pages + 1) << PAGE_SHIFT;
	let range = POOL_SPACE
		.lock()
		.allocate(PageLayout::from_size_align(total_bytes, PAGE_SIZE).unwrap())
		.map_err(|_| KeStatus::InsufficientMemory)?;

	let guard_va = range.start();
	let base = guard_va + PAGE_SIZE;

	mm::lock_kernel_space_exclusive();

	let result = (|| {
		paging::map_anon_pages(base, size_pages, Protection::READ | Protection::WRITE)?;

		let index = register_entry(PoolSpaceEntry { base, size_pages });
		let guard_pte_ptr = paging::get_pte_location_check(guard_va, true).ok_or_else(|| {
			paging::unmap_pages(base, size_pages, true);
			POOL_ENTRIES.lock()[index] = None;
			KeStatus::InsufficientMemory
		})?;

		unsafe {
			core::ptr::write_volatile(
				guard_pte_ptr,
				Pte::from_bits(PteFlags::IS_POOL_HEADER.bits() | ((index as u64) << PAGE_SHIFT)),
			);
		}

		Ok(base)
	})();

	mm::unlock_kernel_space();

	if result.is_err() {
		unsafe {
			POOL_SPACE.lock().deallocate(range).ok();
		}
	}

	result
}

/// Recovers the bookkeeping entry of a pool-space allocation from its
/// base address: one read of the guard page's PTE.
pub fn pool_space_entry_from_address(base: usize) -> Option<PoolSpaceEntry> {
	if !(POOL_SPACE_BASE..POOL_SPACE_BASE + POOL_SPACE_SIZE).contains(&base) {
		return None;
	}

	let guard_pte_ptr = paging::get_pte_location_check(base - PAGE_SIZE, false)?;
	let pte = unsafe { core::ptr::read_volatile(guard_pte_ptr) };
	if !pte.flags().contains(PteFlags::IS_POOL_HEADER) {
		return None;
	}

	let index = (pte.bits() >> PAGE_SHIFT) as usize & 0xFFF_FFFF;
	POOL_ENTRIES.lock().get(index).copied().flatten()
}

/// Frees a pool-space allocation by its base address.
pub fn free_pool_space(base: usize) -> Status {
	let entry = pool_space_entry_from_address(base).ok_or(KeStatus::InvalidParameter)?;
	debug_assert_eq!(entry.base, base);

	mm::lock_kernel_space_exclusive();

	paging::unmap_pages(entry.base, entry.size_pages, true);

	let guard_va = entry.base - PAGE_SIZE;
	if let Some(guard_pte_ptr) = paging::get_pte_location_check(guard_va, false) {
		let pte = unsafe { core::ptr::read_volatile(guard_pte_ptr) };
		let index = (pte.bits() >> PAGE_SHIFT) as usize & 0xFFF_FFFF;
		POOL_ENTRIES.lock()[index] = None;
		unsafe {
			core::ptr::write_volatile(guard_pte_ptr, Pte::ZERO);
		}
	}

	paging::free_unused_mapping_levels_in_current_map(
		guard_va,
		(entry.size_pages + 1) << PAGE_SHIFT,
	);

	mm::unlock_kernel_space();

	mm::issue_tlb_shootdown(entry.base, entry.size_pages << PAGE_SHIFT);

	unsafe {
		POOL_SPACE
			.lock()
			.deallocate(PageRange::new(guard_va, entry.base + (entry.size_pages << PAGE_SHIFT)).unwrap())
			.map_err(|_| KeStatus::InvalidParameter)?;
	}

	Ok(())
}
