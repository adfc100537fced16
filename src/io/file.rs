//! File objects: the user-visible handle targets over FCBs.

use alloc::sync::Arc;
use core::cell::Cell;

use bitflags::bitflags;

use crate::ke::Mutex;
use crate::mm::mdl::{Mdl, MdlFlags};
use crate::mm::pfn::{self, Pfn};
use crate::mm::section::Mappable;
use crate::status::{KeStatus, Status};

use super::fcb::Fcb;
use super::rdwr;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct FileFlags: u32 {
		/// Every write lands at the end of the file.
		const APPEND_ONLY = 1 << 0;
	}
}

pub struct FileObject {
	pub fcb: Arc<Fcb>,
	pub open_flags: u32,
	pub flags: FileFlags,

	/// Implicit position of the next read or write.
	current_offset: Cell<u64>,
	offset_mutex: Mutex,

	/// Directory-iteration cursor and the directory version it belongs
	/// to; a version mismatch restarts the walk.
	dir_cursor: Cell<(u64, u64)>,
}

// The offset is guarded by its mutex, the cursor by the directory read
// path.
unsafe impl Send for FileObject {}
unsafe impl Sync for FileObject {}

impl FileObject {
	pub fn create(fcb: Arc<Fcb>, flags: FileFlags, open_flags: u32) -> Arc<FileObject> {
		let file = Arc::new(FileObject {
			fcb: fcb.clone(),
			open_flags,
			flags,
			current_offset: Cell::new(0),
			offset_mutex: Mutex::new(),
			dir_cursor: Cell::new((0, 0)),
		});

		fcb.dispatch.create_object(&fcb, &file);
		file
	}

	pub fn mappable(&self) -> &dyn Mappable {
		self
	}

	/// Runs `f` with the file offset locked, handing it the current value
	/// and storing what it returns.
	pub fn with_offset<R>(&self, f: impl FnOnce(u64) -> (u64, R)) -> R {
		let _guard = self.offset_mutex.guard();
		let (next, result) = f(self.current_offset.get());
		self.current_offset.set(next);
		result
	}

	pub fn dir_cursor(&self) -> (u64, u64) {
		self.dir_cursor.get()
	}

	pub fn set_dir_cursor(&self, cursor: (u64, u64)) {
		self.dir_cursor.set(cursor);
	}

	/// A resident page of the file, with a reference, if the cache holds
	/// one.
	pub fn cached_page(&self, offset_page: u64) -> Option<Pfn> {
		self.fcb.page_cache.find_and_reference(offset_page)
	}

	/// Brings the page at `offset_page` into the cache through the
	/// driver's paging-read path.
	///
	/// Returns the referenced frame, or [`KeStatus::Refault`] when a
	/// concurrent fault published the page first.
	pub fn page_in(&self, offset_page: u64) -> Status<Pfn> {
		let fcb = &self.fcb;

		// Make sure the cache slot can exist before committing a frame.
		let slot = {
			let guard = fcb.page_cache.lock();
			fcb.page_cache
				.entry_ptr(offset_page, true, &guard)?
				.ok_or(KeStatus::InsufficientMemory)?
		};

		let pfn = pfn::allocate_physical_page().ok_or(KeStatus::InsufficientMemory)?;

		// The driver may legitimately fill less than a page (the file's
		// tail); whatever it leaves alone must read as zero.
		unsafe {
			core::ptr::write_bytes(
				crate::mm::hhdm_addr(pfn.address()) as *mut u8,
				0,
				crate::config::PAGE_SIZE,
			);
		}

		let mdl = Mdl::single_page(pfn, MdlFlags::WRITE);
		let offset = offset_page * crate::config::PAGE_SIZE as u64;
		if let Err(err) = rdwr::perform_paging_read(self, &mdl, offset) {
			pfn::free_physical_page(pfn);
			return Err(match err {
				KeStatus::InsufficientMemory => KeStatus::RefaultSleep,
				other => other,
			});
		}

		let guard = fcb.page_cache.lock();
		match fcb
			.page_cache
			.install(Arc::as_ptr(fcb), offset_page, pfn, slot)
		{
			Ok(()) => {
				drop(guard);
				// The mapping about to be created owns the allocation's
				// reference; the cache's hold is the weak back-pointer.
				Ok(pfn)
			}
			Err(status) => {
				drop(guard);
				pfn::free_physical_page(pfn);
				Err(status)
			}
		}
	}
}

impl Mappable for FileObject {
	fn get_page(&self, offset_page: u64) -> Status<Pfn> {
		if let Some(pfn) = self.cached_page(offset_page) {
			return Ok(pfn);
		}
		self.page_in(offset_page)
	}

	fn read_page(&self, offset_page: u64) -> Status<Pfn> {
		self.page_in(offset_page)
	}

	fn prepare_write(&self, offset_page: u64) -> Status {
		self.fcb.page_cache.mark_modified(offset_page);
		Ok(())
	}
}

impl Drop for FileObject {
	fn drop(&mut self) {
		self.fcb.dispatch.delete_object(&self.fcb, self);
	}
}
