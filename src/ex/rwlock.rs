//! The executive read/writer lock.
//!
//! Built from one synchronization event (exclusive handoff), one counting
//! semaphore (shared wakeup), and a guarding spin lock. Both acquire paths
//! are recursive; a thread that owns the lock exclusively may also take it
//! "shared" and simply deepens its exclusive hold.
//!
//! Waiters park on the event or the semaphore with a bounded timeout and
//! probe again, so a missed wakeup can delay an acquire but never lose it.

use core::ptr::NonNull;

use smallvec::SmallVec;

use crate::config::RWLOCK_WAIT_TIMEOUT_MS;
use crate::ke::semaphore::SEMAPHORE_LIMIT_NONE;
use crate::ke::thread::Thread;
use crate::ke::wait::wait_for_single;
use crate::ke::{Event, EventKind, Semaphore, SpinLock, sched};
use crate::status::{KeStatus, Status};

/// One hold on the lock: the holding thread and its recursion depth.
#[derive(Clone, Copy)]
struct OwnerRecord {
	thread: *const Thread,
	count: u32,
}

struct RwState {
	/// The exclusive hold, if any. The thread pointer is filled in by the
	/// releaser on direct handoff and fixed up by the waiter itself once
	/// it returns from the wait.
	exclusive: Option<OwnerRecord>,
	/// Shared holds; the first slot lives inline.
	shared_owners: SmallVec<[OwnerRecord; 1]>,
	shared_waiter_count: u32,
	exclusive_waiter_count: u32,
	/// Owner records currently holding the lock (shared records plus one
	/// for an exclusive hold); recursion does not count.
	held_count: u32,
}

pub struct RwLock {
	state: SpinLock<RwState>,
	exclusive_event: Event,
	shared_semaphore: Semaphore,
}

// Owner records hold raw thread pointers purely as identity keys.
unsafe impl Send for RwLock {}
unsafe impl Sync for RwLock {}

/// Identity of the calling thread, for ownership bookkeeping.
fn current_thread_key() -> *const Thread {
	#[cfg(target_os = "none")]
	{
		alloc::sync::Arc::as_ptr(&sched::current_thread())
	}
	#[cfg(not(target_os = "none"))]
	{
		NonNull::dangling().as_ptr()
	}
}

impl RwLock {
	pub const fn new() -> Self {
		Self {
			state: SpinLock::new(RwState {
				exclusive: None,
				shared_owners: SmallVec::new_const(),
				shared_waiter_count: 0,
				exclusive_waiter_count: 0,
				held_count: 0,
			}),
			exclusive_event: Event::new(EventKind::Synchronization, false),
			shared_semaphore: Semaphore::new(0, SEMAPHORE_LIMIT_NONE),
		}
	}

	/// Parks on `object` until it is signaled, probing for progress at a
	/// bounded interval.
	fn wait_for_progress(object: &dyn crate::ke::wait::Dispatch) -> Status {
		loop {
			match wait_for_single(object, false, Some(RWLOCK_WAIT_TIMEOUT_MS)) {
				Ok(()) => return Ok(()),
				Err(KeStatus::Timeout) => continue,
				Err(status) => return Err(status),
			}
		}
	}

	/// Acquires the lock exclusively.
	///
	/// With `dont_block`, failure to take the lock immediately returns
	/// [`KeStatus::Timeout`]. With `alertable`, a pending termination is
	/// honored before the thread commits to waiting.
	pub fn acquire_exclusive(&self, dont_block: bool, alertable: bool) -> Status {
		let me = current_thread_key();

		{
			let mut state = self.state.lock();

			if state.held_count == 0 {
				state.held_count = 1;
				state.exclusive = Some(OwnerRecord { thread: me, count: 1 });
				return Ok(());
			}

			if let Some(exclusive) = state.exclusive.as_mut() {
				if exclusive.thread == me {
					exclusive.count += 1;
					return Ok(());
				}
			}

			if dont_block {
				return Err(KeStatus::Timeout);
			}

			if alertable && sched::current_thread().pending_termination() {
				return Err(KeStatus::Killed);
			}

			state.exclusive_waiter_count += 1;
		}

		Self::wait_for_progress(&self.exclusive_event)?;

		// The releaser handed the lock over; it may not have known who we
		// are, so stamp the record.
		let mut state = self.state.lock();
		let exclusive = state
			.exclusive
			.as_mut()
			.expect("woken for exclusive ownership of an unowned rwlock");
		exclusive.thread = me;

		Ok(())
	}

	/// Acquires the lock shared.
	///
	/// `can_starve` lets the caller join an existing shared hold even when
	/// exclusive waiters are queued.
	pub fn acquire_shared(&self, dont_block: bool, alertable: bool, can_starve: bool) -> Status {
		let me = current_thread_key();

		{
			let mut state = self.state.lock();

			if state.held_count == 0 {
				state.held_count = 1;
				state.shared_owners.push(OwnerRecord { thread: me, count: 1 });
				return Ok(());
			}

			if let Some(exclusive) = state.exclusive.as_mut() {
				if exclusive.thread == me {
					// Already ours exclusively; deepen that hold so the
					// release path needs no special case.
					exclusive.count += 1;
					return Ok(());
				}
			} else {
				// Held shared by others.
				if let Some(owner) = state
					.shared_owners
					.iter_mut()
					.find(|owner| owner.thread == me)
				{
					owner.count += 1;
					return Ok(());
				}

				if can_starve || state.exclusive_waiter_count == 0 {
					state.held_count += 1;
					state.shared_owners.push(OwnerRecord { thread: me, count: 1 });
					return Ok(());
				}
			}

			if dont_block {
				return Err(KeStatus::Timeout);
			}

			if alertable && sched::current_thread().pending_termination() {
				return Err(KeStatus::Killed);
			}

			// Register the shared hold up front; the releaser bumps
			// `held_count` for every registered waiter it wakes.
			state.shared_owners.push(OwnerRecord { thread: me, count: 1 });
			state.shared_waiter_count += 1;
		}

		Self::wait_for_progress(&self.shared_semaphore)
	}

	/// Converts an exclusive hold into a shared one, letting every queued
	/// shared waiter in alongside.
	pub fn demote_to_shared(&self) {
		let me = current_thread_key();
		let mut state = self.state.lock();

		let exclusive = state
			.exclusive
			.take()
			.expect("demoting an rwlock that is not held exclusively");
		assert!(
			exclusive.thread == me,
			"demoting an rwlock owned by another thread"
		);

		state.shared_owners.push(exclusive);

		let waiters = state.shared_waiter_count;
		if waiters > 0 {
			state.held_count += waiters;
			state.shared_waiter_count = 0;
			self.shared_semaphore
				.release(waiters as i32)
				.expect("shared semaphore overflow");
		}
	}

	/// Releases one level of the caller's hold; the final release grants
	/// the lock to an exclusive waiter if one is queued, else to all
	/// shared waiters.
	pub fn release(&self) {
		let me = current_thread_key();
		let mut state = self.state.lock();

		let exclusive = match state.exclusive.as_mut() {
			Some(record) if record.thread == me => true,
			_ => false,
		};

		if exclusive {
			let record = state.exclusive.as_mut().unwrap();
			record.count -= 1;
			if record.count > 0 {
				return;
			}
			state.exclusive = None;
		} else {
			let index = state
				.shared_owners
				.iter()
				.position(|owner| owner.thread == me);
			let Some(index) = index else {
				crate::ke::crash(format_args!(
					"rwlock {self:p} released by a thread that does not hold it"
				));
			};

			state.shared_owners[index].count -= 1;
			if state.shared_owners[index].count > 0 {
				return;
			}
			state.shared_owners.remove(index);
		}

		assert!(state.held_count > 0);
		state.held_count -= 1;

		if state.held_count > 0 {
			return;
		}

		// The lock drained; prefer an exclusive waiter.
		if state.exclusive_waiter_count > 0 {
			state.exclusive_waiter_count -= 1;
			state.held_count = 1;

			let woken = self.exclusive_event.set_and_get_waiter(1);
			state.exclusive = Some(OwnerRecord {
				thread: woken
					.as_deref()
					.map(|thread| thread as *const Thread)
					.unwrap_or(core::ptr::null()),
				count: 1,
			});
			return;
		}

		let waiters = state.shared_waiter_count;
		if waiters > 0 {
			state.shared_waiter_count = 0;
			state.held_count = waiters;
			self.shared_semaphore
				.release(waiters as i32)
				.expect("shared semaphore overflow");
		}
	}

	/// Whether anything holds the lock right now.
	pub fn is_held(&self) -> bool {
		self.state.lock().held_count > 0
	}
}

#[cfg(not(target_os = "none"))]
#[test]
fn exclusive_recursion_and_release() {
	let lock = RwLock::new();
	assert!(!lock.is_held());

	lock.acquire_exclusive(false, false).unwrap();
	lock.acquire_exclusive(false, false).unwrap();
	lock.acquire_shared(false, false, false).unwrap();

	lock.release();
	lock.release();
	assert!(lock.is_held());
	lock.release();
	assert!(!lock.is_held());
}

#[cfg(not(target_os = "none"))]
#[test]
fn shared_recursion_and_demote() {
	let lock = RwLock::new();

	lock.acquire_shared(false, false, false).unwrap();
	lock.acquire_shared(false, false, false).unwrap();
	lock.release();
	lock.release();
	assert!(!lock.is_held());

	lock.acquire_exclusive(false, false).unwrap();
	lock.demote_to_shared();
	assert!(lock.is_held());
	lock.release();
	assert!(!lock.is_held());
}
