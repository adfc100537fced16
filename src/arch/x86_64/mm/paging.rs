//! The page-table manager.
//!
//! The table of the running address space is reached through a recursive
//! self-mapping: entry [`RECURSIVE_INDEX`] of every root table points back
//! at the root, which turns any page-table entry into one well-known
//! virtual address. Table pages for *other* address spaces are edited
//! through the higher-half direct map instead.

#![allow(dead_code)]

use core::arch::asm;
use core::ptr;

use bitflags::bitflags;

use crate::config::{KERNEL_SPACE_BASE, PAGE_SIZE};
use crate::mm::pfn::{self, Pfn};
use crate::mm::{Protection, hhdm_addr};
use crate::status::{KeStatus, Status};

/// Root-table slot reserved for the recursive self-mapping.
const RECURSIVE_INDEX: usize = 510;

/// Number of index bits per table level.
const PAGE_MAP_BITS: usize = 9;
const PAGE_MAP_MASK: usize = 0x1FF;

const ENTRIES_PER_TABLE: usize = 512;

/// First root-table slot belonging to kernel space. Kernel mappings are
/// shared by copying these slots into every new root table.
const KERNEL_PML4_START: usize = 256;

bitflags! {
	/// Flags of a page-table entry at any level.
	///
	/// Bits 52..58 are ignored by the MMU and carry the executive's
	/// software page states. A PTE is *software* when it is not present
	/// but one of those bits is set.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PteFlags: u64 {
		/// Set if this entry is valid and points to a page or table.
		const PRESENT = 1 << 0;

		/// Set if memory referenced by this entry shall be writable.
		const WRITABLE = 1 << 1;

		/// Set if memory referenced by this entry shall be accessible
		/// from user mode.
		const USER_ACCESSIBLE = 1 << 2;

		/// Set if write-through caching shall be enabled.
		const WRITE_THROUGH = 1 << 3;

		/// Set if caching shall be disabled.
		const CACHE_DISABLE = 1 << 4;

		const ACCESSED = 1 << 5;
		const DIRTY = 1 << 6;
		const HUGE_PAGE = 1 << 7;

		/// Survives CR3 reloads.
		const GLOBAL = 1 << 8;

		/// The page is committed but not yet materialized; the fault
		/// handler allocates it on first touch.
		const COMMITTED = 1 << 52;

		/// The page was explicitly decommitted.
		const DECOMMITTED = 1 << 53;

		/// The page was present once; used to tell a paged-out page from
		/// a never-touched one.
		const WAS_PRESENT = 1 << 54;

		/// The frame referenced by this entry came from the physical page
		/// allocator and carries a reference there.
		const FROM_PMM = 1 << 55;

		/// Writes must be resolved through the copy-on-write path.
		const COW = 1 << 56;

		/// This is a pool guard page; the rest of the entry encodes the
		/// pool-entry backlink.
		const IS_POOL_HEADER = 1 << 57;

		/// Set if code execution shall be disabled.
		const EXECUTE_DISABLE = 1 << 63;
	}
}

impl PteFlags {
	pub fn device(&mut self) -> &mut Self {
		self.insert(PteFlags::CACHE_DISABLE);
		self
	}

	pub fn normal(&mut self) -> &mut Self {
		self.remove(PteFlags::CACHE_DISABLE);
		self
	}

	pub fn read_only(&mut self) -> &mut Self {
		self.remove(PteFlags::WRITABLE);
		self
	}

	pub fn writable(&mut self) -> &mut Self {
		self.insert(PteFlags::WRITABLE);
		self
	}

	pub fn execute_disable(&mut self) -> &mut Self {
		self.insert(PteFlags::EXECUTE_DISABLE);
		self
	}
}

/// Mask of the physical-frame bits of a 4 KiB entry.
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Bits that make a non-present entry a *software* PTE.
const SOFTWARE_MASK: u64 = PteFlags::COMMITTED.bits()
	| PteFlags::DECOMMITTED.bits()
	| PteFlags::WAS_PRESENT.bits()
	| PteFlags::IS_POOL_HEADER.bits();

/// One page-table entry at any level.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
	pub const ZERO: Pte = Pte(0);

	pub fn from_bits(bits: u64) -> Self {
		Pte(bits)
	}

	pub fn bits(self) -> u64 {
		self.0
	}

	pub fn new(frame: u64, flags: PteFlags) -> Self {
		debug_assert_eq!(frame & !ADDRESS_MASK, 0);
		Pte(frame | flags.bits())
	}

	pub fn flags(self) -> PteFlags {
		PteFlags::from_bits_truncate(self.0)
	}

	pub fn is_present(self) -> bool {
		self.flags().contains(PteFlags::PRESENT)
	}

	/// A non-present entry that still carries executive page state.
	pub fn is_software(self) -> bool {
		!self.is_present() && (self.0 & SOFTWARE_MASK) != 0
	}

	pub fn is_zero(self) -> bool {
		self.0 == 0
	}

	pub fn address(self) -> u64 {
		self.0 & ADDRESS_MASK
	}

	pub fn pfn(self) -> Pfn {
		Pfn::from_address(self.address() as usize)
	}

	pub fn insert(&mut self, flags: PteFlags) {
		self.0 |= flags.bits();
	}

	pub fn remove(&mut self, flags: PteFlags) {
		self.0 &= !flags.bits();
	}

	/// Replaces the frame bits, keeping the flags.
	pub fn set_address(&mut self, frame: u64) {
		debug_assert_eq!(frame & !ADDRESS_MASK, 0);
		self.0 = (self.0 & !ADDRESS_MASK) | frame;
	}
}

impl core::fmt::Debug for Pte {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "Pte({:#x} {:?})", self.address(), self.flags())
	}
}

/// Handle to a root page table, identified by its physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping(pub u64);

#[inline]
fn sign_extend(address: usize) -> usize {
	if address & (1 << 47) != 0 {
		address | 0xFFFF_0000_0000_0000
	} else {
		address & 0x0000_FFFF_FFFF_FFFF
	}
}

/// Virtual address of the L1 entry mapping `va`, through the self-mapping.
#[inline]
fn recursive_l1_entry(va: usize) -> *mut Pte {
	let addr = (RECURSIVE_INDEX << 39) | ((va >> 9) & 0x0000_007F_FFFF_F000);
	sign_extend(addr) as *mut Pte
}

/// Virtual address of the L2 (page-directory) entry covering `va`.
#[inline]
fn recursive_l2_entry(va: usize) -> *mut Pte {
	let addr =
		(RECURSIVE_INDEX << 39) | (RECURSIVE_INDEX << 30) | ((va >> 18) & 0x0000_0000_3FFF_F000);
	sign_extend(addr) as *mut Pte
}

/// Virtual address of the L3 (page-directory-pointer) entry covering `va`.
#[inline]
fn recursive_l3_entry(va: usize) -> *mut Pte {
	let addr = (RECURSIVE_INDEX << 39)
		| (RECURSIVE_INDEX << 30)
		| (RECURSIVE_INDEX << 21)
		| ((va >> 27) & 0x0000_0000_001F_F000);
	sign_extend(addr) as *mut Pte
}

/// Virtual address of the L4 (root) entry covering `va`.
#[inline]
fn recursive_l4_entry(va: usize) -> *mut Pte {
	let addr = (RECURSIVE_INDEX << 39)
		| (RECURSIVE_INDEX << 30)
		| (RECURSIVE_INDEX << 21)
		| (RECURSIVE_INDEX << 12)
		| ((va >> 36) & 0x0000_0000_0000_0FF8);
	sign_extend(addr) as *mut Pte
}

/// Flushes one page translation from this CPU's TLB.
#[inline]
pub fn flush(va: usize) {
	unsafe {
		asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
	}
}

#[inline]
pub fn flush_all() {
	unsafe {
		let cr3: u64;
		asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
		asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
	}
}

/// Physical address of the running address space's root table.
#[inline]
pub fn current_page_mapping() -> PageMapping {
	let cr3: u64;
	unsafe {
		asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
	}
	PageMapping(cr3 & ADDRESS_MASK)
}

/// Switches to another address space.
pub unsafe fn switch_page_mapping(mapping: PageMapping) {
	unsafe {
		asm!("mov cr3, {}", in(reg) mapping.0, options(nostack, preserves_flags));
	}
}

/// Allocates a zeroed page-table page.
fn allocate_table_page() -> Status<Pfn> {
	let pfn = pfn::allocate_physical_page().ok_or(KeStatus::InsufficientMemory)?;
	unsafe {
		ptr::write_bytes(hhdm_addr(pfn.address()) as *mut u8, 0, PAGE_SIZE);
	}
	Ok(pfn)
}

/// Creates a fresh address space: kernel half shared with the current root
/// table, recursive slot pointing at itself, user half empty.
pub fn create_page_mapping() -> Status<PageMapping> {
	let root = allocate_table_page()?;
	let root_phys = root.address() as u64;

	unsafe {
		let new_table = hhdm_addr(root.address()) as *mut u64;
		let current_table = hhdm_addr(current_page_mapping().0 as usize) as *const u64;

		for i in KERNEL_PML4_START..ENTRIES_PER_TABLE {
			if i == RECURSIVE_INDEX {
				continue;
			}
			ptr::write(new_table.add(i), ptr::read(current_table.add(i)));
		}

		ptr::write(
			new_table.add(RECURSIVE_INDEX),
			root_phys | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::EXECUTE_DISABLE).bits(),
		);
	}

	Ok(PageMapping(root_phys))
}

/// Releases the user half of an address space and the root table itself.
///
/// All user mappings must have been torn down already; only empty
/// intermediate tables are reclaimed here.
pub fn free_page_mapping(mapping: PageMapping) {
	unsafe fn free_level(table_phys: u64, level: usize) {
		let table = unsafe { &*(hhdm_addr(table_phys as usize) as *const [u64; ENTRIES_PER_TABLE]) };
		for (i, &entry) in table.iter().enumerate() {
			if entry & PteFlags::PRESENT.bits() == 0 {
				continue;
			}
			if level == 4 && (i >= KERNEL_PML4_START || i == RECURSIVE_INDEX) {
				continue;
			}
			// Recursion stops at the page directories: their entries name
			// L1 table pages, which are freed here without scanning them
			// (leaf mappings must be gone before the map is freed).
			if level > 2 {
				unsafe {
					free_level(entry & ADDRESS_MASK, level - 1);
				}
			}
			pfn::free_physical_page(Pfn::from_address((entry & ADDRESS_MASK) as usize));
		}
	}

	unsafe {
		free_level(mapping.0, 4);
	}
	pfn::free_physical_page(Pfn::from_address(mapping.0 as usize));
}

/// Pointer to the L1 entry of `va`, assuming all levels exist.
pub fn get_pte_location(va: usize) -> *mut Pte {
	recursive_l1_entry(va)
}

/// Pointer to the L1 entry of `va` in the current address space.
///
/// With `generate`, missing intermediate levels are allocated (and become
/// visible through the self-mapping); without it, `None` is returned when
/// any level is absent.
pub fn get_pte_location_check(va: usize, generate: bool) -> Option<*mut Pte> {
	let levels = [
		recursive_l4_entry(va),
		recursive_l3_entry(va),
		recursive_l2_entry(va),
	];

	for (depth, &entry_ptr) in levels.iter().enumerate() {
		let entry = unsafe { ptr::read_volatile(entry_ptr) };
		if entry.is_present() {
			continue;
		}
		if !generate {
			return None;
		}

		let table = allocate_table_page().ok()?;
		let mut new_entry = Pte::new(
			table.address() as u64,
			PteFlags::PRESENT | PteFlags::WRITABLE,
		);
		// Intermediate levels of user mappings must allow user access;
		// the leaf PTE has the final say.
		if va < KERNEL_SPACE_BASE {
			new_entry.insert(PteFlags::USER_ACCESSIBLE);
		}
		unsafe {
			ptr::write_volatile(entry_ptr, new_entry);
		}
		// The table window the self-mapping exposes for the new level may
		// still be stale in the TLB.
		let window = [recursive_l3_entry(va), recursive_l2_entry(va), recursive_l1_entry(va)][depth];
		flush(window as usize & !(PAGE_SIZE - 1));
	}

	Some(recursive_l1_entry(va))
}

/// Makes sure the root-table slot covering `va` exists.
///
/// The kernel windows do this once at boot, before the first process is
/// created, so the root-entry copy in [`create_page_mapping`] hands every
/// address space a complete kernel half.
pub fn preallocate_kernel_root_entry(va: usize) -> Status {
	debug_assert!(va >= KERNEL_SPACE_BASE);

	let l4_ptr = recursive_l4_entry(va);
	let entry = unsafe { ptr::read_volatile(l4_ptr) };
	if entry.is_present() {
		return Ok(());
	}

	let table = allocate_table_page()?;
	unsafe {
		ptr::write_volatile(
			l4_ptr,
			Pte::new(table.address() as u64, PteFlags::PRESENT | PteFlags::WRITABLE),
		);
	}
	flush(align_down!(recursive_l3_entry(va) as usize, PAGE_SIZE));
	Ok(())
}

/// Converts an executive protection into leaf PTE bits.
pub fn pte_bits_from_protection(protection: Protection) -> PteFlags {
	let mut flags = PteFlags::empty();
	if protection.contains(Protection::WRITE) {
		flags.insert(PteFlags::WRITABLE);
	}
	if !protection.contains(Protection::EXECUTE) {
		flags.insert(PteFlags::EXECUTE_DISABLE);
	}
	flags
}

/// Maps a freshly allocated anonymous page at `va`.
pub fn map_anon_page(va: usize, protection: Protection) -> Status {
	let pfn = pfn::allocate_physical_page().ok_or(KeStatus::InsufficientMemory)?;
	if let Err(err) = map_physical_page(va, pfn.address() as u64, protection) {
		pfn::free_physical_page(pfn);
		return Err(err);
	}

	unsafe {
		let pte_ptr = recursive_l1_entry(va);
		(*pte_ptr).insert(PteFlags::FROM_PMM);
	}
	Ok(())
}

/// Maps `count` freshly allocated anonymous pages starting at `va`,
/// unwinding on failure.
pub fn map_anon_pages(va: usize, count: usize, protection: Protection) -> Status {
	for i in 0..count {
		if let Err(err) = map_anon_page(va + i * PAGE_SIZE, protection) {
			unmap_pages(va, i, true);
			return Err(err);
		}
	}
	Ok(())
}

/// Maps the physical page `frame` at `va` in the current address space.
pub fn map_physical_page(va: usize, frame: u64, protection: Protection) -> Status {
	let pte_ptr = get_pte_location_check(va, true).ok_or(KeStatus::InsufficientMemory)?;

	let mut flags = PteFlags::PRESENT | pte_bits_from_protection(protection);
	if va < KERNEL_SPACE_BASE {
		flags.insert(PteFlags::USER_ACCESSIBLE);
	} else {
		flags.insert(PteFlags::GLOBAL);
	}

	unsafe {
		let old = ptr::read_volatile(pte_ptr);
		if old.is_present() {
			return Err(KeStatus::ConflictingAddresses);
		}
		ptr::write_volatile(pte_ptr, Pte::new(frame, flags));
	}
	flush(va);
	Ok(())
}

/// Unmaps `count` pages starting at `va`, optionally returning the frames
/// of `FROM_PMM` mappings to the physical allocator.
pub fn unmap_pages(va: usize, count: usize, free_frames: bool) {
	for i in 0..count {
		let page_va = va + i * PAGE_SIZE;
		let Some(pte_ptr) = get_pte_location_check(page_va, false) else {
			continue;
		};

		let pte = unsafe { ptr::read_volatile(pte_ptr) };
		if pte.is_zero() {
			continue;
		}

		unsafe {
			ptr::write_volatile(pte_ptr, Pte::ZERO);
		}

		if pte.is_present() {
			flush(page_va);
			if free_frames && pte.flags().contains(PteFlags::FROM_PMM) {
				pfn::free_physical_page(pte.pfn());
			}
		}
	}
}

/// Returns now-empty page-table pages in `start..start + size` to the
/// physical allocator.
///
/// Walks the tables the range touches bottom-up: an L1 whose 512 entries
/// are all zero is unlinked from its L2 and freed, then emptied L2s and
/// L3s get the same treatment.
pub fn free_unused_mapping_levels_in_current_map(start: usize, size: usize) {
	let end = start + size;

	// A table page, viewed through the self-mapping, that contains only
	// zero entries.
	fn table_is_empty(table: *const u64) -> bool {
		(0..ENTRIES_PER_TABLE).all(|i| unsafe { ptr::read_volatile(table.add(i)) } == 0)
	}

	let l1_span = PAGE_SIZE << PAGE_MAP_BITS;
	let mut va = align_down!(start, l1_span);
	while va < end {
		let l2_ptr = recursive_l2_entry(va);
		let l2 = unsafe { ptr::read_volatile(l2_ptr) };
		if l2.is_present() {
			let table = align_down!(recursive_l1_entry(va) as usize, PAGE_SIZE) as *const u64;
			if table_is_empty(table) {
				unsafe {
					ptr::write_volatile(l2_ptr, Pte::ZERO);
				}
				pfn::free_physical_page(l2.pfn());
				flush(table as usize);
			}
		}

		va += l1_span;
	}

	let l2_span = l1_span << PAGE_MAP_BITS;
	let mut va = align_down!(start, l2_span);
	while va < end {
		let l3_ptr = recursive_l3_entry(va);
		let l3 = unsafe { ptr::read_volatile(l3_ptr) };
		if l3.is_present() {
			let table = align_down!(recursive_l2_entry(va) as usize, PAGE_SIZE) as *const u64;
			if table_is_empty(table) {
				unsafe {
					ptr::write_volatile(l3_ptr, Pte::ZERO);
				}
				pfn::free_physical_page(l3.pfn());
				flush(table as usize);
			}
		}

		va += l2_span;
	}

	let l3_span = l2_span << PAGE_MAP_BITS;
	let mut va = align_down!(start, l3_span);
	while va < end {
		// Kernel-half root entries are copied into every address space at
		// creation; the tables they point at are shared and must stay.
		if va >= KERNEL_SPACE_BASE {
			break;
		}

		let l4_ptr = recursive_l4_entry(va);
		let l4 = unsafe { ptr::read_volatile(l4_ptr) };
		if l4.is_present() {
			let table = align_down!(recursive_l3_entry(va) as usize, PAGE_SIZE) as *const u64;
			if table_is_empty(table) {
				unsafe {
					ptr::write_volatile(l4_ptr, Pte::ZERO);
				}
				pfn::free_physical_page(l4.pfn());
				flush(table as usize);
			}
		}

		va += l3_span;
	}
}

/// Ensures a writable 4 KiB page is mapped at `va`, walking the tables of
/// `root` through the direct map. Missing levels and the page itself come
/// from `allocate`. Used while the page-frame database is bootstrapped,
/// before the self-mapping is usable for allocation.
pub unsafe fn boot_map_page_if_absent(
	root: PageMapping,
	va: usize,
	flags: PteFlags,
	allocate: &mut dyn FnMut() -> Option<u64>,
) -> bool {
	let mut table_phys = root.0;

	for level in (1..4).rev() {
		let index = (va >> (12 + PAGE_MAP_BITS * level)) & PAGE_MAP_MASK;
		let entry_ptr = unsafe { (hhdm_addr(table_phys as usize) as *mut u64).add(index) };
		let entry = unsafe { ptr::read(entry_ptr) };

		if entry & PteFlags::PRESENT.bits() != 0 {
			table_phys = entry & ADDRESS_MASK;
		} else {
			let Some(new_table) = allocate() else {
				return false;
			};
			unsafe {
				ptr::write_bytes(hhdm_addr(new_table as usize) as *mut u8, 0, PAGE_SIZE);
				ptr::write(
					entry_ptr,
					new_table | (PteFlags::PRESENT | PteFlags::WRITABLE).bits(),
				);
			}
			table_phys = new_table;
		}
	}

	let index = (va >> 12) & PAGE_MAP_MASK;
	unsafe {
		let entry_ptr = (hhdm_addr(table_phys as usize) as *mut u64).add(index);
		if ptr::read(entry_ptr) & PteFlags::PRESENT.bits() != 0 {
			return true;
		}
		let Some(frame) = allocate() else {
			return false;
		};
		ptr::write_bytes(hhdm_addr(frame as usize) as *mut u8, 0, PAGE_SIZE);
		ptr::write(entry_ptr, frame | flags.bits());
	}
	true
}
