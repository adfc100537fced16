//! IPL-raising ticket spin locks.
//!
//! Acquiring one of these raises the IPL of the executing processor to the
//! lock's level (at least `Dpc`) before spinning, so that nothing that
//! could block can interleave with the critical section and the holder can
//! never be preempted by code that takes the same lock.

#![allow(dead_code)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::ke::ipl::{self, Ipl};

/// The raw ticket lock; completely fair.
pub(crate) struct RawSpin {
	queue: CachePadded<AtomicUsize>,
	dequeue: CachePadded<AtomicUsize>,
}

impl RawSpin {
	pub const fn new() -> Self {
		Self {
			queue: CachePadded::new(AtomicUsize::new(0)),
			dequeue: CachePadded::new(AtomicUsize::new(1)),
		}
	}

	pub fn lock(&self) {
		let backoff = Backoff::new();
		let ticket = self.queue.fetch_add(1, Ordering::Relaxed) + 1;

		while self.dequeue.load(Ordering::Acquire) != ticket {
			backoff.spin();
		}
	}

	pub fn unlock(&self) {
		self.dequeue.fetch_add(1, Ordering::Release);
	}

	/// Whether somebody currently holds the lock.
	pub fn is_locked(&self) -> bool {
		self.dequeue.load(Ordering::Acquire) != self.queue.load(Ordering::Acquire) + 1
	}
}

/// A ticket spin lock that raises the IPL to `level` for the duration of
/// the critical section.
pub struct SpinLock<T: ?Sized> {
	raw: RawSpin,
	level: Ipl,
	data: UnsafeCell<T>,
}

pub struct SpinLockGuard<'a, T: ?Sized> {
	raw: &'a RawSpin,
	old_ipl: Ipl,
	data: &'a mut T,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
	pub const fn new(user_data: T) -> Self {
		Self::with_level(user_data, Ipl::Dpc)
	}

	pub const fn with_level(user_data: T, level: Ipl) -> Self {
		Self {
			raw: RawSpin::new(),
			level,
			data: UnsafeCell::new(user_data),
		}
	}
}

impl<T: ?Sized> SpinLock<T> {
	pub fn lock(&self) -> SpinLockGuard<'_, T> {
		let old_ipl = ipl::raise_if_needed(self.level);
		self.raw.lock();

		SpinLockGuard {
			raw: &self.raw,
			old_ipl,
			data: unsafe { &mut *self.data.get() },
		}
	}
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		self.data
	}
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		self.data
	}
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
	fn drop(&mut self) {
		self.raw.unlock();
		ipl::lower_if_needed(self.old_ipl);
	}
}
