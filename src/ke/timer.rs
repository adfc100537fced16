//! The timer dispatcher object and the per-CPU timer queues.
//!
//! A set timer sits in the queue of the CPU that armed it, sorted by
//! absolute expiry tick. Tick processing at IPL `Dpc` pops every timer due
//! within [`TIMER_EXPIRY_SLACK_TICKS`] of now, signals it, and enqueues its
//! DPC if one was attached.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::{Cell, RefCell};

use crate::config::TIMER_EXPIRY_SLACK_TICKS;
use crate::hal;
use crate::ke::dpc::{self, Dpc};
use crate::ke::wait::{
	Dispatch, DispatchHeader, DispatcherGuard, ObjectKind, assert_dispatcher_locked,
	lock_dispatcher, wait_test,
};
use crate::ke::{self, CoreId};

pub struct Timer {
	header: DispatchHeader,
	expiry_tick: Cell<u64>,
	/// CPU whose queue holds this timer, while enqueued.
	enqueued_on: Cell<Option<CoreId>>,
	dpc: RefCell<Option<Arc<Dpc>>>,
}

// Guarded by the dispatcher lock.
unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
	pub const fn new() -> Self {
		Self {
			header: DispatchHeader::new(ObjectKind::Timer, 0),
			expiry_tick: Cell::new(0),
			enqueued_on: Cell::new(None),
			dpc: RefCell::new(None),
		}
	}

	pub fn read_state(&self) -> bool {
		self.header.read_state() != 0
	}

	pub(crate) fn expiry_tick(&self) -> u64 {
		self.expiry_tick.get()
	}

	/// Arms the timer to signal `due_ms` milliseconds from now, optionally
	/// firing `dpc` on expiry. Returns whether it was already enqueued.
	pub fn set(self: &Arc<Self>, due_ms: u64, dpc: Option<Arc<Dpc>>) -> bool {
		let guard = lock_dispatcher();
		set_timer_locked(self, due_ms, dpc, &guard)
	}

	/// Disarms the timer. Returns whether it was enqueued.
	pub fn cancel(self: &Arc<Self>) -> bool {
		let guard = lock_dispatcher();
		cancel_timer_locked(self, &guard)
	}
}

impl Dispatch for Timer {
	fn header(&self) -> &DispatchHeader {
		&self.header
	}
}

/// The per-CPU queue of armed timers, kept sorted by expiry tick.
pub(crate) struct TimerQueue {
	timers: VecDeque<Arc<Timer>>,
}

impl TimerQueue {
	pub const fn new() -> Self {
		Self {
			timers: VecDeque::new(),
		}
	}

	fn insert(&mut self, timer: Arc<Timer>) {
		let expiry = timer.expiry_tick();
		let position = self
			.timers
			.iter()
			.position(|queued| queued.expiry_tick() > expiry)
			.unwrap_or(self.timers.len());
		self.timers.insert(position, timer);
	}

	fn remove(&mut self, timer: &Arc<Timer>) -> bool {
		let before = self.timers.len();
		self.timers.retain(|queued| !Arc::ptr_eq(queued, timer));
		self.timers.len() != before
	}

	fn next_expiry(&self) -> Option<u64> {
		self.timers.front().map(|timer| timer.expiry_tick())
	}
}

pub(crate) fn set_timer_locked(
	timer: &Arc<Timer>,
	due_ms: u64,
	dpc: Option<Arc<Dpc>>,
	guard: &DispatcherGuard,
) -> bool {
	assert_dispatcher_locked();

	let was_enqueued = cancel_timer_locked(timer, guard);
	if was_enqueued {
		debug!("timer {:p} was re-armed while enqueued", Arc::as_ptr(timer));
	}

	let expiry = hal::tick_count() + hal::ms_to_ticks(due_ms);
	timer.expiry_tick.set(expiry);
	timer.header.set_signaled(0, guard);
	*timer.dpc.borrow_mut() = dpc;

	let Some(prcb) = ke::try_prcb() else {
		return was_enqueued;
	};
	timer.enqueued_on.set(Some(prcb.id));
	prcb.timer_queue.borrow_mut().insert(timer.clone());

	program_interval_timer(guard);
	was_enqueued
}

pub(crate) fn cancel_timer_locked(timer: &Arc<Timer>, _guard: &DispatcherGuard) -> bool {
	let Some(core) = timer.enqueued_on.take() else {
		return false;
	};

	if let Some(prcb) = ke::prcb_by_id(core) {
		prcb.timer_queue.borrow_mut().remove(timer)
	} else {
		false
	}
}

/// Reprograms the one-shot interval timer for the earliest armed timer of
/// this CPU, when the HAL offers one.
fn program_interval_timer(_guard: &DispatcherGuard) {
	let Some(prcb) = ke::try_prcb() else {
		return;
	};

	if let Some(expiry) = prcb.timer_queue.borrow().next_expiry() {
		let now = hal::tick_count();
		let delta = expiry.saturating_sub(now).max(1);
		hal::request_interrupt_in_ticks(delta);
	}
}

/// Pops and signals every timer of this CPU due within the expiry slack.
///
/// Runs at IPL `Dpc` from the software-interrupt dispatch.
pub(crate) fn dispatch_expired_timers() {
	let Some(prcb) = ke::try_prcb() else {
		return;
	};

	let guard = lock_dispatcher();
	let now = hal::tick_count();

	loop {
		let timer = {
			let mut queue = prcb.timer_queue.borrow_mut();
			match queue.timers.front() {
				Some(front) if front.expiry_tick() < now + TIMER_EXPIRY_SLACK_TICKS => {
					queue.timers.pop_front().unwrap()
				}
				_ => break,
			}
		};

		timer.enqueued_on.set(None);

		if let Some(dpc) = timer.dpc.borrow_mut().take() {
			dpc::enqueue(&dpc, 0, 0);
		}

		timer.header.set_signaled(1, &guard);
		wait_test(&*timer, 0, &guard);
	}

	program_interval_timer(&guard);
}
