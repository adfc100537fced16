//! Cache control blocks: the per-file page cache.
//!
//! A CCB maps file page offsets to resident frames through a sparse
//! linear array. The cache's hold on a frame is *weak* — the frame's
//! database entry carries the back-pointer, and turning a cached frame
//! into a real reference happens under the frame-database lock, where the
//! entry is re-read so a concurrent reclaim cannot win the race.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::ke::Mutex;
use crate::ke::mutex::MutexGuard;
use crate::mm::pfn::{self, Pfn};
use crate::mm::section::{entry_to_pfn, pfn_to_entry};
use crate::mm::sla::Sla;
use crate::status::{KeStatus, Status};

pub struct Ccb {
	mutex: Mutex,
	sla: Sla,
}

// The array is guarded by the mutex; frame transitions additionally take
// the frame-database lock.
unsafe impl Send for Ccb {}
unsafe impl Sync for Ccb {}

impl Ccb {
	pub const fn new() -> Self {
		Self {
			mutex: Mutex::new(),
			sla: Sla::new(),
		}
	}

	pub fn lock(&self) -> MutexGuard<'_> {
		self.mutex.guard()
	}

	/// Resolves the slot for `page_offset`, optionally allocating the
	/// array levels on the way down.
	pub(crate) fn entry_ptr(
		&self,
		page_offset: u64,
		generate: bool,
		_guard: &MutexGuard<'_>,
	) -> Status<Option<*mut u64>> {
		self.sla.entry_ptr(page_offset, generate)
	}

	/// Looks up a resident page and upgrades the cache's weak hold into a
	/// caller-owned reference.
	pub fn find_and_reference(&self, page_offset: u64) -> Option<Pfn> {
		let guard = self.lock();
		let slot = self.entry_ptr(page_offset, false, &guard).ok()??;

		pfn::with_database(|db| {
			// Re-read under the database lock; reclaim clears the entry
			// in the same critical section it steals the frame in.
			let entry = unsafe { core::ptr::read_volatile(slot) };
			let pfn = entry_to_pfn(entry)?;
			db.reference_cached(pfn).then_some(pfn)
		})
	}

	/// Publishes a freshly read page, losing to any concurrent publisher.
	///
	/// On success the frame is adopted by the cache (back-pointer set, the
	/// caller's reference stays the mapping's). On a lost race the caller
	/// must free its frame and refault.
	pub(crate) fn install(
		&self,
		fcb: *const crate::io::fcb::Fcb,
		page_offset: u64,
		pfn: Pfn,
		slot: *mut u64,
	) -> Status {
		let atomic_slot = unsafe { AtomicU64::from_ptr(slot) };
		if atomic_slot
			.compare_exchange(0, pfn_to_entry(pfn), Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Err(KeStatus::Refault);
		}

		pfn::with_database(|db| {
			db.set_prototype(pfn, slot);
			let entry = db.entry(pfn);
			entry.cache_fcb = fcb;
			entry.cache_offset_page = page_offset;
		});

		Ok(())
	}

	/// Marks a cached page dirty so the modified-page writer picks it up
	/// once it is fully unmapped.
	pub fn mark_modified(&self, page_offset: u64) {
		let guard = self.lock();
		let Ok(Some(slot)) = self.entry_ptr(page_offset, false, &guard) else {
			return;
		};

		pfn::with_database(|db| {
			let entry = unsafe { core::ptr::read_volatile(slot) };
			if let Some(pfn) = entry_to_pfn(entry) {
				db.mark_modified(pfn);
			}
		});
	}

	/// Evicts every cached page; the file is going away.
	pub fn teardown(&self) {
		let _guard = self.mutex.guard();

		self.sla.deinit(|entry| {
			if let Some(pfn) = entry_to_pfn(entry) {
				pfn::with_database(|db| db.purge_cached(pfn));
			}
		});
	}
}
