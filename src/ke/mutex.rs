//! The mutex dispatcher object.
//!
//! Recursive and owned. The signal state encodes the recursion depth as
//! `MUTEX_SIGNALED - depth`, so an unowned mutex reads `MUTEX_SIGNALED`
//! and every recursive acquire drops it by one.

use alloc::sync::Arc;
use core::cell::Cell;

use crate::config::MUTEX_SIGNALED;
use crate::ke::thread::Thread;
use crate::ke::wait::{
	Dispatch, DispatchHeader, DispatcherGuard, ObjectKind, lock_dispatcher, wait_test,
};
use crate::ke::{self, sched};

pub struct Mutex {
	header: DispatchHeader,
	/// Owning thread while the depth is at least one.
	owner: Cell<Option<*const Thread>>,
}

// The owner cell is only touched under the dispatcher lock.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
	pub const fn new() -> Self {
		Self {
			header: DispatchHeader::new(ObjectKind::Mutex, MUTEX_SIGNALED),
			owner: Cell::new(None),
		}
	}

	pub fn read_state(&self) -> i32 {
		self.header.read_state()
	}

	/// Blocks until the calling thread owns the mutex.
	pub fn acquire(&self) {
		#[cfg(target_os = "none")]
		{
			crate::ke::wait::wait_for_single(self, false, None)
				.expect("an untimed non-alertable mutex wait cannot fail");
		}
	}

	/// Acquires the mutex and releases it when the guard drops.
	pub fn guard(&self) -> MutexGuard<'_> {
		self.acquire();
		MutexGuard { mutex: self }
	}

	fn owned_by(&self, thread: &Thread) -> bool {
		self.owner.get() == Some(thread as *const Thread)
	}

	/// Releases one level of ownership; at depth zero the mutex is
	/// signaled and the next waiter acquires it.
	///
	/// Releasing a mutex the calling thread does not own, or releasing
	/// more often than it was acquired, is fatal.
	pub fn release(&self) {
		let guard = lock_dispatcher();
		self.release_locked(&guard);
	}

	pub(crate) fn release_locked(&self, guard: &DispatcherGuard) {
		let current = sched::current_thread();

		if !self.owned_by(&current) {
			ke::crash(format_args!(
				"mutex {:p} released by thread {} which does not own it",
				self, current.id
			));
		}

		let signaled = self.header.signaled(guard) + 1;
		if signaled > MUTEX_SIGNALED {
			ke::crash(format_args!(
				"mutex {self:p} released more often than acquired"
			));
		}
		self.header.set_signaled(signaled, guard);

		if signaled == MUTEX_SIGNALED {
			self.owner.set(None);
			wait_test(self, 1, guard);
		}
	}
}

/// Scoped ownership of a [`Mutex`].
pub struct MutexGuard<'a> {
	mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
	fn drop(&mut self) {
		#[cfg(target_os = "none")]
		self.mutex.release();
		#[cfg(not(target_os = "none"))]
		let _ = self.mutex;
	}
}

impl Dispatch for Mutex {
	fn header(&self) -> &DispatchHeader {
		&self.header
	}

	fn satisfiable(&self, thread: &Thread, guard: &DispatcherGuard) -> bool {
		self.header.signaled(guard) == MUTEX_SIGNALED || self.owned_by(thread)
	}

	fn acquire(&self, thread: &Arc<Thread>, guard: &DispatcherGuard) {
		debug_assert!(self.satisfiable(thread, guard));
		self.header.set_signaled(self.header.signaled(guard) - 1, guard);
		self.owner.set(Some(Arc::as_ptr(thread)));
	}
}
