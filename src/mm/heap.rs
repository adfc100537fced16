//! The heap of free address space.
//!
//! Each process (and the system view window) tracks the *free* portion of
//! its address range as an ordered tree of `(start, size-in-pages)` nodes.
//! Allocation is first-fit in address order, or last-fit for top-down
//! requests; freed ranges coalesce with both neighbors.

use alloc::collections::BTreeMap;
use core::cell::RefCell;

use crate::config::PAGE_SIZE;
use crate::ke::Mutex;
use crate::status::{KeStatus, Status};

pub struct AddressHeap {
	/// Free ranges, keyed by start address, sized in pages.
	tree: RefCell<BTreeMap<usize, usize>>,
	mutex: Mutex,
}

// Guarded by the embedded mutex.
unsafe impl Send for AddressHeap {}
unsafe impl Sync for AddressHeap {}

impl AddressHeap {
	pub const fn new() -> Self {
		Self {
			tree: RefCell::new(BTreeMap::new()),
			mutex: Mutex::new(),
		}
	}

	/// Seeds the heap with an initial free range. Init only; no locking.
	pub fn create_region(&self, start_va: usize, size_pages: usize) -> Status {
		let mut tree = self.tree.borrow_mut();
		if tree.insert(start_va, size_pages).is_some() {
			return Err(KeStatus::AlreadyLinked);
		}
		Ok(())
	}

	/// Carves `size_pages` out of the free space. First-fit from the
	/// bottom, or from the top when `top_down` is set.
	pub fn allocate(&self, size_pages: usize, top_down: bool) -> Status<usize> {
		if size_pages == 0 {
			return Err(KeStatus::InvalidParameter);
		}

		let _guard = self.mutex.guard();
		let mut tree = self.tree.borrow_mut();

		let found = if top_down {
			tree.iter()
				.rev()
				.find(|&(_, &size)| size >= size_pages)
				.map(|(&start, &size)| (start, size))
		} else {
			tree.iter()
				.find(|&(_, &size)| size >= size_pages)
				.map(|(&start, &size)| (start, size))
		};

		let Some((start, size)) = found else {
			return Err(KeStatus::InsufficientMemory);
		};

		tree.remove(&start);

		if size == size_pages {
			return Ok(start);
		}

		let remaining = size - size_pages;
		if top_down {
			tree.insert(start, remaining);
			Ok(start + remaining * PAGE_SIZE)
		} else {
			tree.insert(start + size_pages * PAGE_SIZE, remaining);
			Ok(start)
		}
	}

	/// Returns a range to the free space, merging it with adjacent free
	/// neighbors.
	pub fn free(&self, start_va: usize, size_pages: usize) -> Status {
		if size_pages == 0 {
			return Err(KeStatus::InvalidParameter);
		}

		let _guard = self.mutex.guard();
		let mut tree = self.tree.borrow_mut();

		let mut start = start_va;
		let mut size = size_pages;

		// Merge with the neighbor below.
		if let Some((&prev_start, &prev_size)) = tree.range(..start_va).next_back() {
			if prev_start + prev_size * PAGE_SIZE == start_va {
				tree.remove(&prev_start);
				start = prev_start;
				size += prev_size;
			} else if prev_start + prev_size * PAGE_SIZE > start_va {
				return Err(KeStatus::ConflictingAddresses);
			}
		}

		// Merge with the neighbor above.
		if let Some((&next_start, &next_size)) = tree.range(start_va..).next() {
			if start_va + size_pages * PAGE_SIZE == next_start {
				tree.remove(&next_start);
				size += next_size;
			} else if start_va + size_pages * PAGE_SIZE > next_start {
				return Err(KeStatus::ConflictingAddresses);
			}
		}

		tree.insert(start, size);
		Ok(())
	}

	/// Copies the free-space layout into `dest`, which must be empty.
	pub(crate) fn clone_into(&self, dest: &AddressHeap) -> Status {
		let _guard = self.mutex.guard();
		let tree = self.tree.borrow();

		let mut dest_tree = dest.tree.borrow_mut();
		if !dest_tree.is_empty() {
			return Err(KeStatus::ConflictingAddresses);
		}
		dest_tree.clone_from(&tree);
		Ok(())
	}

	/// Drops every range; the failure-unwind path of the clone.
	pub(crate) fn reset(&self) {
		let _guard = self.mutex.guard();
		self.tree.borrow_mut().clear();
	}

	/// Total free pages tracked by this heap.
	pub fn free_pages(&self) -> usize {
		let _guard = self.mutex.guard();
		self.tree.borrow().values().sum()
	}

	#[cfg(not(target_os = "none"))]
	fn ranges(&self) -> alloc::vec::Vec<(usize, usize)> {
		self.tree.borrow().iter().map(|(&s, &n)| (s, n)).collect()
	}
}

#[cfg(not(target_os = "none"))]
#[test]
fn allocate_and_free_round_trip() {
	let heap = AddressHeap::new();
	heap.create_region(0x40_0000, 256).unwrap();
	let before = heap.ranges();

	let va = heap.allocate(16, false).unwrap();
	assert_eq!(va, 0x40_0000);
	heap.free(va, 16).unwrap();

	assert_eq!(heap.ranges(), before);
}

#[cfg(not(target_os = "none"))]
#[test]
fn top_down_allocation_carves_the_tail() {
	let heap = AddressHeap::new();
	heap.create_region(0x40_0000, 256).unwrap();

	let va = heap.allocate(16, true).unwrap();
	assert_eq!(va, 0x40_0000 + 240 * PAGE_SIZE);
	assert_eq!(heap.free_pages(), 240);
}

#[cfg(not(target_os = "none"))]
#[test]
fn clone_copies_the_layout() {
	let heap = AddressHeap::new();
	heap.create_region(0x40_0000, 256).unwrap();
	heap.allocate(32, false).unwrap();

	let copy = AddressHeap::new();
	heap.clone_into(&copy).unwrap();
	assert_eq!(heap.ranges(), copy.ranges());

	// A populated destination is refused.
	assert_eq!(
		heap.clone_into(&copy),
		Err(KeStatus::ConflictingAddresses)
	);
}

#[cfg(not(target_os = "none"))]
#[test]
fn freed_neighbors_coalesce() {
	let heap = AddressHeap::new();
	heap.create_region(0x40_0000, 64).unwrap();

	let a = heap.allocate(8, false).unwrap();
	let b = heap.allocate(8, false).unwrap();
	let c = heap.allocate(8, false).unwrap();
	assert_eq!(heap.ranges().len(), 1);

	heap.free(a, 8).unwrap();
	heap.free(c, 8).unwrap();
	assert_eq!(heap.ranges().len(), 2);

	heap.free(b, 8).unwrap();
	assert_eq!(heap.ranges(), vec![(0x40_0000, 64)]);
}
