//! The event dispatcher object.

use alloc::sync::Arc;

use crate::ke::thread::Thread;
use crate::ke::wait::{
	Dispatch, DispatchHeader, DispatcherGuard, ObjectKind, WaitKind, lock_dispatcher,
	wait_for_multiple_locked, wait_test,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	/// Auto-reset: satisfying one waiter consumes the signal.
	Synchronization,
	/// Manual-reset: once signaled, every wait succeeds until reset.
	Notification,
}

pub struct Event {
	header: DispatchHeader,
	kind: EventKind,
}

impl Event {
	pub const fn new(kind: EventKind, signaled: bool) -> Self {
		Self {
			header: DispatchHeader::new(ObjectKind::Event, signaled as i32),
			kind,
		}
	}

	pub fn kind(&self) -> EventKind {
		self.kind
	}

	pub fn read_state(&self) -> bool {
		self.header.read_state() != 0
	}

	pub(crate) fn set_locked(&self, boost: u8, guard: &DispatcherGuard) {
		self.header.set_signaled(1, guard);
		wait_test(self, boost, guard);
	}

	pub(crate) fn reset_locked(&self, guard: &DispatcherGuard) {
		self.header.set_signaled(0, guard);
	}

	/// Signals the event and releases waiters whose wait is now satisfied.
	pub fn set(&self, boost: u8) {
		let guard = lock_dispatcher();
		self.set_locked(boost, &guard);
	}

	pub fn reset(&self) {
		let guard = lock_dispatcher();
		self.reset_locked(&guard);
	}

	/// Signals and immediately resets: wakes whoever the signal satisfies
	/// right now, and leaves the event unsignaled either way.
	pub fn pulse(&self, boost: u8) {
		let guard = lock_dispatcher();
		self.set_locked(boost, &guard);
		self.reset_locked(&guard);
	}

	/// Signals a synchronization event and returns the thread the signal
	/// went to, if any. Used for direct lock handoff.
	pub(crate) fn set_and_get_waiter(&self, boost: u8) -> Option<Arc<Thread>> {
		debug_assert_eq!(self.kind, EventKind::Synchronization);

		let guard = lock_dispatcher();
		self.header.set_signaled(1, &guard);
		wait_test(self, boost, &guard)
	}

	/// Signals this event and waits on `object`, atomically: no other
	/// signal or wait can interleave between the two.
	pub fn set_and_wait(
		&self,
		boost: u8,
		object: &dyn Dispatch,
		alertable: bool,
		timeout: Option<u64>,
	) -> Result<(), crate::status::KeStatus> {
		let guard = lock_dispatcher();
		self.set_locked(boost, &guard);
		wait_for_multiple_locked(&[object], WaitKind::Any, alertable, timeout, guard).map(|_| ())
	}

	/// Resets this event and waits on `object`, atomically.
	pub fn reset_and_wait(
		&self,
		object: &dyn Dispatch,
		alertable: bool,
		timeout: Option<u64>,
	) -> Result<(), crate::status::KeStatus> {
		let guard = lock_dispatcher();
		self.reset_locked(&guard);
		wait_for_multiple_locked(&[object], WaitKind::Any, alertable, timeout, guard).map(|_| ())
	}

	/// Pulses this event and waits on `object`, atomically.
	pub fn pulse_and_wait(
		&self,
		boost: u8,
		object: &dyn Dispatch,
		alertable: bool,
		timeout: Option<u64>,
	) -> Result<(), crate::status::KeStatus> {
		let guard = lock_dispatcher();
		self.set_locked(boost, &guard);
		self.reset_locked(&guard);
		wait_for_multiple_locked(&[object], WaitKind::Any, alertable, timeout, guard).map(|_| ())
	}
}

impl Dispatch for Event {
	fn header(&self) -> &DispatchHeader {
		&self.header
	}

	fn acquire(&self, _thread: &Arc<Thread>, guard: &DispatcherGuard) {
		if self.kind == EventKind::Synchronization {
			self.header.set_signaled(0, guard);
		}
	}
}

#[cfg(not(target_os = "none"))]
#[test]
fn notification_event_keeps_signal() {
	let event = Event::new(EventKind::Notification, false);
	assert!(!event.read_state());
	event.set(0);
	assert!(event.read_state());
	event.reset();
	assert!(!event.read_state());
}
