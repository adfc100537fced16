//! File control blocks.
//!
//! An FCB is the kernel's per-file state: length, type, the page cache,
//! the lock serializing structural changes, and the dispatch table the
//! owning driver registered. File objects (the handle targets) layer on
//! top; many file objects can share one FCB.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::any::Any;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::ex::RwLock;
use crate::ke::Mutex;
use crate::mm::cache::Ccb;
use crate::mm::mdl::Mdl;
use crate::status::{KeStatus, Status};

bitflags! {
	/// Properties of a driver's dispatch table.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct DispatchFlags: u32 {
		/// Every read and write takes the FCB lock exclusive.
		const EXCLUSIVE = 1 << 0;
	}
}

bitflags! {
	/// Flags passed down the read/write paths.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct RwFlags: u32 {
		/// The transfer is on behalf of the fault handler or the
		/// modified-page writer; it must not recurse into the cache.
		const PAGING = 1 << 0;
		/// The caller holds the FCB exclusive.
		const LOCKED_EXCLUSIVE = 1 << 1;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
	File,
	Directory,
	Pipe,
	Device,
	Partition,
}

/// One directory entry as a driver reports it.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
	pub name: alloc::string::String,
	pub inode: u64,
	pub file_type: FileType,
}

/// The operations a driver supplies for its files.
///
/// Everything is optional except `read`/`write` for data-bearing files;
/// the defaults reject or no-op the way an absent function pointer would.
pub trait FcbDispatch: Send + Sync {
	fn flags(&self) -> DispatchFlags {
		DispatchFlags::empty()
	}

	fn open(&self, _fcb: &Fcb, _open_flags: u32) -> Status {
		Ok(())
	}

	fn close(&self, _fcb: &Fcb, _handle_count: u32) -> Status {
		Ok(())
	}

	/// Transfers from the file into the MDL. Returns bytes transferred.
	fn read(&self, _fcb: &Fcb, _offset: u64, _mdl: &Mdl, _flags: RwFlags) -> Status<usize> {
		Err(KeStatus::UnsupportedFunction)
	}

	/// Transfers from the MDL into the file. Returns bytes transferred.
	fn write(&self, _fcb: &Fcb, _offset: u64, _mdl: &Mdl, _flags: RwFlags) -> Status<usize> {
		Err(KeStatus::UnsupportedFunction)
	}

	/// Reads the directory entry at `cursor`, advancing it.
	fn read_dir(&self, _fcb: &Fcb, _cursor: &mut u64) -> Status<DirectoryEntry> {
		Err(KeStatus::UnsupportedFunction)
	}

	/// Updates access/modification metadata.
	fn touch(&self, _fcb: &Fcb, _is_write: bool) -> Status {
		Err(KeStatus::UnsupportedFunction)
	}

	/// Frame backing `offset_page` for device files mapped directly.
	fn backing_memory(&self, _fcb: &Fcb, _offset_page: u64) -> Status<crate::mm::pfn::Pfn> {
		Err(KeStatus::UnsupportedFunction)
	}

	/// A file object over this FCB came to life.
	fn create_object(&self, _fcb: &Fcb, _file: &super::file::FileObject) {}

	/// A file object over this FCB was deleted.
	fn delete_object(&self, _fcb: &Fcb, _file: &super::file::FileObject) {}

	/// Required buffer alignment; 1 when unspecified.
	fn get_alignment_info(&self, _fcb: &Fcb) -> usize {
		1
	}

	/// Whether offsets mean anything for this file.
	fn seekable(&self) -> bool {
		true
	}

	fn reference(&self, _fcb: &Fcb) {}

	fn dereference(&self, _fcb: &Fcb) {}
}

pub struct Fcb {
	pub dispatch: &'static dyn FcbDispatch,
	pub file_type: FileType,
	file_length: AtomicU64,

	/// The page cache of this file.
	pub page_cache: Ccb,
	/// Serializes writes (and whole-file operations) against reads.
	pub rwlock: RwLock,

	/// System-space views of this file, keyed by section offset, so the
	/// cached read path can find an existing window.
	pub(crate) view_tree: RefCell<BTreeMap<u64, usize>>,
	pub(crate) view_mutex: Mutex,

	/// Driver-private per-file state.
	pub extension: Option<Box<dyn Any + Send + Sync>>,
}

// The view tree is guarded by its mutex; everything else synchronizes
// itself.
unsafe impl Send for Fcb {}
unsafe impl Sync for Fcb {}

impl Fcb {
	pub fn new(
		dispatch: &'static dyn FcbDispatch,
		file_type: FileType,
		file_length: u64,
		extension: Option<Box<dyn Any + Send + Sync>>,
	) -> Arc<Fcb> {
		let fcb = Arc::new(Fcb {
			dispatch,
			file_type,
			file_length: AtomicU64::new(file_length),
			page_cache: Ccb::new(),
			rwlock: RwLock::new(),
			view_tree: RefCell::new(BTreeMap::new()),
			view_mutex: Mutex::new(),
			extension,
		});

		fcb.dispatch.reference(&fcb);
		fcb
	}

	pub fn file_length(&self) -> u64 {
		self.file_length.load(Ordering::Acquire)
	}

	pub fn set_file_length(&self, length: u64) {
		self.file_length.store(length, Ordering::Release);
	}

	pub fn is_seekable(&self) -> bool {
		self.dispatch.seekable()
	}

	pub fn extension<T: 'static>(&self) -> Option<&T> {
		self.extension.as_ref()?.downcast_ref()
	}
}

impl Drop for Fcb {
	fn drop(&mut self) {
		// Purge the cache first: the frame database carries raw pointers
		// back into this FCB for the modified-page writer.
		self.page_cache.teardown();
		self.dispatch.dereference(self);
	}
}
