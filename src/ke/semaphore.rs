//! The semaphore dispatcher object.
//!
//! Acquiring a semaphore is done by waiting on it; each satisfied wait
//! consumes one count.

use alloc::sync::Arc;

use crate::ke::thread::Thread;
use crate::ke::wait::{
	Dispatch, DispatchHeader, DispatcherGuard, ObjectKind, lock_dispatcher, wait_test,
};
use crate::status::{KeStatus, Status};

pub const SEMAPHORE_LIMIT_NONE: i32 = i32::MAX;

pub struct Semaphore {
	header: DispatchHeader,
	limit: i32,
}

impl Semaphore {
	pub fn new(count: i32, limit: i32) -> Self {
		debug_assert!(count >= 0 && count <= limit);
		Self {
			header: DispatchHeader::new(ObjectKind::Semaphore, count),
			limit,
		}
	}

	pub fn read_state(&self) -> i32 {
		self.header.read_state()
	}

	pub fn limit(&self) -> i32 {
		self.limit
	}

	/// Adds `adjustment` to the count, releasing waiters that the new
	/// count satisfies. Fails without side effects if the count would
	/// cross the limit.
	pub fn release(&self, adjustment: i32) -> Status {
		let guard = lock_dispatcher();
		self.release_locked(adjustment, &guard)
	}

	pub(crate) fn release_locked(&self, adjustment: i32, guard: &DispatcherGuard) -> Status {
		if adjustment <= 0 {
			return Err(KeStatus::InvalidParameter);
		}

		let signaled = self.header.signaled(guard);
		let Some(new_count) = signaled.checked_add(adjustment) else {
			return Err(KeStatus::InvalidParameter);
		};
		if new_count > self.limit {
			return Err(KeStatus::InvalidParameter);
		}

		self.header.set_signaled(new_count, guard);
		debug_assert!(new_count > 0);

		wait_test(self, 1, guard);
		Ok(())
	}
}

impl Dispatch for Semaphore {
	fn header(&self) -> &DispatchHeader {
		&self.header
	}

	fn satisfiable(&self, _thread: &Thread, guard: &DispatcherGuard) -> bool {
		self.header.signaled(guard) > 0
	}

	fn acquire(&self, _thread: &Arc<Thread>, guard: &DispatcherGuard) {
		let signaled = self.header.signaled(guard);
		debug_assert!(signaled > 0);
		self.header.set_signaled(signaled - 1, guard);
	}
}

#[cfg(not(target_os = "none"))]
#[test]
fn release_respects_the_limit() {
	let semaphore = Semaphore::new(1, 2);
	assert_eq!(semaphore.release(1), Ok(()));
	assert_eq!(semaphore.read_state(), 2);
	assert_eq!(semaphore.release(1), Err(KeStatus::InvalidParameter));
	assert_eq!(semaphore.read_state(), 2);
}
