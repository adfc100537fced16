//! Virtual address descriptors.
//!
//! One [`Vad`] describes one reservation in an address space: its range,
//! its protection, and — for mapped views — the object backing it. A
//! process owns a [`VadList`]; system-space views live in a single
//! process-independent list owned by [`crate::mm::view`]. Descriptors in
//! one list never overlap.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cell::RefCell;

use crate::config::PAGE_SIZE;
use crate::io::file::FileObject;
use crate::ke::Mutex;
use crate::ke::mutex::MutexGuard;
use crate::mm::Protection;
use crate::mm::section::{Mappable, Overlay, Section};
use crate::status::{KeStatus, Status};

/// The object a mapped descriptor resolves its pages through.
#[derive(Clone)]
pub enum MappedObject {
	File(Arc<FileObject>),
	Section(Arc<Section>),
	Overlay(Arc<Overlay>),
}

impl MappedObject {
	pub fn mappable(&self) -> &dyn Mappable {
		match self {
			MappedObject::File(file) => file.mappable(),
			MappedObject::Section(section) => &**section,
			MappedObject::Overlay(overlay) => &**overlay,
		}
	}

	pub fn is_file(&self) -> bool {
		matches!(self, MappedObject::File(_))
	}
}

/// One virtual address descriptor.
pub struct Vad {
	pub start_va: usize,
	pub size_pages: usize,

	/// The whole range is committed; the fault handler materializes pages
	/// on first touch.
	pub committed: bool,
	/// Not shared with any other address space.
	pub private: bool,
	/// Writes resolve through the copy-on-write path.
	pub cow: bool,
	pub protection: Protection,

	pub mapped_object: Option<MappedObject>,
	/// Byte offset into the mapped object at which this view starts.
	pub section_offset: u64,
}

impl Vad {
	pub fn end_va(&self) -> usize {
		self.start_va + self.size_pages * PAGE_SIZE
	}

	pub fn contains(&self, va: usize) -> bool {
		(self.start_va..self.end_va()).contains(&va)
	}

	pub fn is_file(&self) -> bool {
		self.mapped_object
			.as_ref()
			.is_some_and(MappedObject::is_file)
	}
}

/// The descriptor list of one address space: an ordered tree keyed by
/// start address, guarded by a mutex.
pub struct VadList {
	tree: RefCell<BTreeMap<usize, Vad>>,
	mutex: Mutex,
}

// Guarded by the embedded mutex.
unsafe impl Send for VadList {}
unsafe impl Sync for VadList {}

impl VadList {
	pub const fn new() -> Self {
		Self {
			tree: RefCell::new(BTreeMap::new()),
			mutex: Mutex::new(),
		}
	}

	/// Locks the list. All accessors below must be called with the
	/// returned guard alive.
	pub fn lock(&self) -> MutexGuard<'_> {
		self.mutex.guard()
	}

	/// Inserts a descriptor, refusing any overlap with an existing one.
	pub fn insert(&self, vad: Vad, _guard: &MutexGuard<'_>) -> Status {
		let mut tree = self.tree.borrow_mut();

		if let Some((_, prev)) = tree.range(..=vad.start_va).next_back() {
			if prev.end_va() > vad.start_va {
				return Err(KeStatus::ConflictingAddresses);
			}
		}
		if let Some((&next_start, _)) = tree.range(vad.start_va..).next() {
			if vad.end_va() > next_start {
				return Err(KeStatus::ConflictingAddresses);
			}
		}

		tree.insert(vad.start_va, vad);
		Ok(())
	}

	/// Removes the descriptor starting exactly at `start_va`.
	pub fn remove(&self, start_va: usize, _guard: &MutexGuard<'_>) -> Option<Vad> {
		self.tree.borrow_mut().remove(&start_va)
	}

	/// Runs `f` on the descriptor covering `va`.
	pub fn with_vad_at<R>(
		&self,
		va: usize,
		_guard: &MutexGuard<'_>,
		f: impl FnOnce(&mut Vad) -> R,
	) -> Option<R> {
		let mut tree = self.tree.borrow_mut();
		let (_, vad) = tree.range_mut(..=va).next_back()?;
		if vad.contains(va) { Some(f(vad)) } else { None }
	}

	/// Runs `f` on every descriptor in address order.
	pub fn for_each<R>(
		&self,
		_guard: &MutexGuard<'_>,
		mut f: impl FnMut(&mut Vad) -> Status<R>,
	) -> Status {
		for vad in self.tree.borrow_mut().values_mut() {
			f(vad)?;
		}
		Ok(())
	}

	/// Start addresses of all descriptors; the teardown paths iterate over
	/// this snapshot so they can remove entries as they go.
	pub fn start_addresses(&self, _guard: &MutexGuard<'_>) -> alloc::vec::Vec<usize> {
		self.tree.borrow().keys().copied().collect()
	}

	pub fn is_empty(&self, _guard: &MutexGuard<'_>) -> bool {
		self.tree.borrow().is_empty()
	}

	pub fn len(&self, _guard: &MutexGuard<'_>) -> usize {
		self.tree.borrow().len()
	}
}

#[cfg(not(target_os = "none"))]
fn anonymous(start_va: usize, size_pages: usize) -> Vad {
	Vad {
		start_va,
		size_pages,
		committed: true,
		private: true,
		cow: false,
		protection: Protection::READ | Protection::WRITE,
		mapped_object: None,
		section_offset: 0,
	}
}

#[cfg(not(target_os = "none"))]
#[test]
fn descriptors_never_overlap() {
	let list = VadList::new();
	let guard = list.lock();

	list.insert(anonymous(0x40_0000, 4), &guard).unwrap();
	list.insert(anonymous(0x40_8000, 4), &guard).unwrap();

	// Collides with the tail of the first descriptor.
	assert_eq!(
		list.insert(anonymous(0x40_3000, 1), &guard),
		Err(KeStatus::ConflictingAddresses)
	);
	// Collides with the head of the second.
	assert_eq!(
		list.insert(anonymous(0x40_7000, 2), &guard),
		Err(KeStatus::ConflictingAddresses)
	);
	// Fits exactly in the hole.
	list.insert(anonymous(0x40_4000, 4), &guard).unwrap();
	assert_eq!(list.len(&guard), 3);
}

#[cfg(not(target_os = "none"))]
#[test]
fn lookup_finds_the_covering_descriptor() {
	let list = VadList::new();
	let guard = list.lock();

	list.insert(anonymous(0x40_0000, 4), &guard).unwrap();

	assert!(list.with_vad_at(0x40_3FFF, &guard, |_| ()).is_some());
	assert!(list.with_vad_at(0x40_4000, &guard, |_| ()).is_none());
	assert!(list.with_vad_at(0x3F_FFFF, &guard, |_| ()).is_none());
}
