//! Section and overlay objects.
//!
//! A *section* is shareable anonymous memory: a sparse array of frames,
//! materialized on first touch. An *overlay* wraps another mappable object
//! and stores only the pages that diverged from it, which is how cloned
//! address spaces implement copy-on-write.
//!
//! Both implement the [`Mappable`] dispatch that the fault handler drives:
//! `get_page` to resolve a resident (or materializable) page, `read_page`
//! to bring one in from backing store, and `prepare_write` to make a page
//! safe for writable mapping.

use alloc::sync::Arc;
use core::cell::Cell;
use core::ptr;

use crate::config::PAGE_SIZE;
use crate::ke::Mutex;
use crate::mm::hhdm_addr;
use crate::mm::pfn::{self, Pfn};
use crate::mm::sla::{Sla, SLA_NO_DATA};
use crate::mm::vad::MappedObject;
use crate::status::{KeStatus, Status};

/// The uniform dispatch every mappable object exposes.
pub trait Mappable: Send + Sync {
	/// Resolves the page at `offset_page` to a frame, materializing it if
	/// the object can do so without I/O. The returned frame carries a
	/// reference for the caller.
	fn get_page(&self, offset_page: u64) -> Status<Pfn>;

	/// Brings the page at `offset_page` in from backing store into a
	/// fresh, referenced frame.
	fn read_page(&self, offset_page: u64) -> Status<Pfn>;

	/// Makes the page at `offset_page` safe to map writable.
	fn prepare_write(&self, offset_page: u64) -> Status;
}

// A frame-bearing array entry: valid bit on top, frame number below.
// Entry zero means empty, so frame 0 still encodes unambiguously.

const ENTRY_VALID: u64 = 1 << 63;

pub(crate) fn entry_to_pfn(entry: u64) -> Option<Pfn> {
	(entry & ENTRY_VALID != 0).then(|| Pfn(entry as u32))
}

pub(crate) fn pfn_to_entry(pfn: Pfn) -> u64 {
	ENTRY_VALID | pfn.0 as u64
}

/// Shareable anonymous memory.
pub struct Section {
	mutex: Mutex,
	sla: Sla,
	max_size_pages: Cell<u64>,
}

// The array is guarded by the mutex; the size is set once at creation.
unsafe impl Send for Section {}
unsafe impl Sync for Section {}

impl Section {
	/// Creates an anonymous section able to hold `max_size` bytes.
	pub fn create(max_size: u64) -> Arc<Section> {
		Arc::new(Section {
			mutex: Mutex::new(),
			sla: Sla::new(),
			max_size_pages: Cell::new(max_size.div_ceil(PAGE_SIZE as u64)),
		})
	}

	pub fn max_size_pages(&self) -> u64 {
		self.max_size_pages.get()
	}

	/// Records `pfn` as the page at `offset_page`, taking over one
	/// reference. The clone path uses this to materialize an address
	/// range into a section.
	pub(crate) fn adopt_page(&self, offset_page: u64, pfn: Pfn) -> Status {
		let _guard = self.mutex.guard();
		debug_assert_eq!(self.sla.look_up(offset_page), SLA_NO_DATA);
		self.sla.assign(offset_page, pfn_to_entry(pfn))?;
		Ok(())
	}
}

impl Mappable for Section {
	fn get_page(&self, offset_page: u64) -> Status<Pfn> {
		if offset_page >= self.max_size_pages.get() {
			return Err(KeStatus::OutOfFileBounds);
		}

		let _guard = self.mutex.guard();

		let entry = self.sla.look_up(offset_page);
		let pfn = match entry_to_pfn(entry) {
			Some(pfn) => pfn,
			None => {
				let pfn = pfn::allocate_physical_page().ok_or(KeStatus::InsufficientMemory)?;
				// Anonymous memory reads as zero on first touch; the
				// allocator's zeroed list is only a fast path.
				unsafe {
					ptr::write_bytes(hhdm_addr(pfn.address()) as *mut u8, 0, PAGE_SIZE);
				}

				if let Err(err) = self.sla.assign(offset_page, pfn_to_entry(pfn)) {
					pfn::free_physical_page(pfn);
					return Err(err);
				}
				pfn
			}
		};

		pfn::page_add_reference(pfn);
		Ok(pfn)
	}

	fn read_page(&self, _offset_page: u64) -> Status<Pfn> {
		// There is no backing store to page in from.
		Err(KeStatus::HardwareIoError)
	}

	fn prepare_write(&self, _offset_page: u64) -> Status {
		// Sections are shared; writes land in the shared frames.
		Ok(())
	}
}

impl Drop for Section {
	fn drop(&mut self) {
		self.sla.deinit(|entry| {
			if let Some(pfn) = entry_to_pfn(entry) {
				pfn::free_physical_page(pfn);
			}
		});
	}
}

/// A copy-on-write wrapper over another mappable object.
///
/// Reads resolve through the parent until a page diverges; a diverged page
/// lives in the overlay's own array and shadows the parent's from then on.
pub struct Overlay {
	mutex: Mutex,
	sla: Sla,
	parent: MappedObject,
}

unsafe impl Send for Overlay {}
unsafe impl Sync for Overlay {}

impl Overlay {
	/// Wraps `parent`; created when a private mapping is cloned.
	pub fn create(parent: MappedObject) -> Arc<Overlay> {
		Arc::new(Overlay {
			mutex: Mutex::new(),
			sla: Sla::new(),
			parent,
		})
	}

	pub fn parent(&self) -> &MappedObject {
		&self.parent
	}
}

impl Mappable for Overlay {
	fn get_page(&self, offset_page: u64) -> Status<Pfn> {
		{
			let _guard = self.mutex.guard();
			if let Some(pfn) = entry_to_pfn(self.sla.look_up(offset_page)) {
				pfn::page_add_reference(pfn);
				return Ok(pfn);
			}
		}

		self.parent.mappable().get_page(offset_page)
	}

	fn read_page(&self, offset_page: u64) -> Status<Pfn> {
		{
			let _guard = self.mutex.guard();
			if let Some(pfn) = entry_to_pfn(self.sla.look_up(offset_page)) {
				pfn::page_add_reference(pfn);
				return Ok(pfn);
			}
		}

		self.parent.mappable().read_page(offset_page)
	}

	/// Diverges the page from the parent: the first write to a page copies
	/// the parent's bytes into a frame owned by this overlay.
	fn prepare_write(&self, offset_page: u64) -> Status {
		let _guard = self.mutex.guard();

		if self.sla.look_up(offset_page) != SLA_NO_DATA {
			return Ok(());
		}

		let parent_pfn = self.parent.mappable().get_page(offset_page)?;

		let pfn = match pfn::allocate_physical_page() {
			Some(pfn) => pfn,
			None => {
				pfn::free_physical_page(parent_pfn);
				return Err(KeStatus::InsufficientMemory);
			}
		};

		unsafe {
			ptr::copy_nonoverlapping(
				hhdm_addr(parent_pfn.address()) as *const u8,
				hhdm_addr(pfn.address()) as *mut u8,
				PAGE_SIZE,
			);
		}
		pfn::free_physical_page(parent_pfn);

		if let Err(err) = self.sla.assign(offset_page, pfn_to_entry(pfn)) {
			pfn::free_physical_page(pfn);
			return Err(err);
		}

		Ok(())
	}
}

impl Drop for Overlay {
	fn drop(&mut self) {
		self.sla.deinit(|entry| {
			if let Some(pfn) = entry_to_pfn(entry) {
				pfn::free_physical_page(pfn);
			}
		});
	}
}
