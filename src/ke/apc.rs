//! Asynchronous procedure calls.
//!
//! APCs are queued per thread. Kernel APCs are delivered through the
//! `Apc`-level software interrupt: their special routine runs at IPL
//! `Apc`, their normal routine after the drop back to `Normal`. User APCs
//! run at IPL `Normal` and are only delivered on the way out to user mode
//! or when the thread enters an alertable wait — in both cases *before*
//! the wait is satisfied or the return happens.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::{Cell, RefCell};

use crate::ke::ipl::{self, Ipl};
use crate::ke::thread::{Thread, ThreadStatus};
use crate::ke::wait::{DispatcherGuard, lock_dispatcher, unwait_thread};
use crate::ke::{self, sched};
use crate::status::KeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApcMode {
	Kernel,
	User,
}

pub type ApcRoutine = fn(&Apc, usize);

pub struct Apc {
	/// Runs at IPL `Apc`.
	special_routine: Option<ApcRoutine>,
	/// Runs at IPL `Normal`.
	normal_routine: Option<ApcRoutine>,
	context: usize,
	mode: ApcMode,
	enqueued: Cell<bool>,
}

unsafe impl Send for Apc {}
unsafe impl Sync for Apc {}

impl Apc {
	pub fn new(
		mode: ApcMode,
		special_routine: Option<ApcRoutine>,
		normal_routine: Option<ApcRoutine>,
		context: usize,
	) -> Arc<Self> {
		Arc::new(Self {
			special_routine,
			normal_routine,
			context,
			mode,
			enqueued: Cell::new(false),
		})
	}

	pub fn context(&self) -> usize {
		self.context
	}
}

/// Per-thread APC state, guarded by the dispatcher lock.
pub(crate) struct ThreadApcState {
	kernel_queue: RefCell<VecDeque<Arc<Apc>>>,
	user_queue: RefCell<VecDeque<Arc<Apc>>>,
	/// Normal routines of kernel APCs whose special half already ran.
	normal_pending: RefCell<VecDeque<Arc<Apc>>>,
	disable_count: Cell<u32>,
	in_progress: Cell<bool>,
}

impl ThreadApcState {
	pub(crate) fn new() -> Self {
		Self {
			kernel_queue: RefCell::new(VecDeque::new()),
			user_queue: RefCell::new(VecDeque::new()),
			normal_pending: RefCell::new(VecDeque::new()),
			disable_count: Cell::new(0),
			in_progress: Cell::new(false),
		}
	}
}

/// Disables APC delivery to the current thread; nests.
pub fn disable_apcs() {
	let thread = sched::current_thread();
	let _guard = lock_dispatcher();
	thread.apc.disable_count.set(thread.apc.disable_count.get() + 1);
}

pub fn enable_apcs() {
	let thread = sched::current_thread();
	let deliver = {
		let _guard = lock_dispatcher();
		let count = thread.apc.disable_count.get();
		debug_assert!(count > 0);
		thread.apc.disable_count.set(count - 1);
		count == 1 && !thread.apc.kernel_queue.borrow().is_empty()
	};

	if deliver && ipl::current() < Ipl::Apc {
		ipl::request_software_interrupt(Ipl::Apc);
		ipl::dispatch_software_interrupts(ipl::current());
	}
}

/// Queues `apc` at `thread`.
///
/// A kernel APC aimed at the executing thread is delivered on the next
/// drop below `Apc`; a user APC aimed at a thread in an alertable wait
/// breaks that wait with [`KeStatus::Alerted`].
pub fn enqueue(thread: &Arc<Thread>, apc: Arc<Apc>) {
	let guard = lock_dispatcher();

	if apc.enqueued.replace(true) {
		return;
	}

	match apc.mode {
		ApcMode::Kernel => {
			thread.apc.kernel_queue.borrow_mut().push_back(apc);

			if Arc::ptr_eq(thread, &sched::current_thread()) {
				ipl::request_software_interrupt(Ipl::Apc);
			}
		}
		ApcMode::User => {
			thread.apc.user_queue.borrow_mut().push_back(apc);

			if thread.status() == ThreadStatus::Waiting && thread.wait.borrow().alertable {
				unwait_thread(thread, Err(KeStatus::Alerted), 1, &guard);
			}
		}
	}
}

pub(crate) fn user_apcs_pending(thread: &Thread, _guard: &DispatcherGuard) -> bool {
	!thread.apc.user_queue.borrow().is_empty()
}

/// Delivers pending kernel APCs to the current thread.
///
/// Runs at IPL `Apc` from the software-interrupt dispatch. Special
/// routines run here; normal routines are parked and run by
/// [`deliver_normal_kernel_apcs`] once the thread is back at `Normal`.
pub(crate) fn deliver_kernel_apcs() {
	debug_assert_eq!(ipl::current(), Ipl::Apc);

	let Some(_prcb) = ke::try_prcb() else {
		return;
	};
	let thread = sched::current_thread();

	loop {
		let apc = {
			let _guard = lock_dispatcher();
			if thread.apc.disable_count.get() > 0 || thread.apc.in_progress.get() {
				return;
			}
			let Some(apc) = thread.apc.kernel_queue.borrow_mut().pop_front() else {
				return;
			};
			thread.apc.in_progress.set(true);
			apc
		};

		apc.enqueued.set(false);
		if let Some(special) = apc.special_routine {
			special(&apc, apc.context);
		}

		let _guard = lock_dispatcher();
		thread.apc.in_progress.set(false);
		if apc.normal_routine.is_some() {
			thread.apc.normal_pending.borrow_mut().push_back(apc);
		}
	}
}

/// Runs parked normal routines of kernel APCs at IPL `Normal`.
pub(crate) fn deliver_normal_kernel_apcs(thread: &Arc<Thread>) {
	debug_assert_eq!(ipl::current(), Ipl::Normal);

	loop {
		let apc = {
			let _guard = lock_dispatcher();
			let Some(apc) = thread.apc.normal_pending.borrow_mut().pop_front() else {
				return;
			};
			apc
		};

		if let Some(normal) = apc.normal_routine {
			normal(&apc, apc.context);
		}
	}
}

/// Delivers pending user APCs to `thread` at IPL `Normal`.
///
/// Called on the way out of an alertable wait and before any return to
/// user mode.
pub(crate) fn deliver_user_apcs(thread: &Arc<Thread>) {
	debug_assert!(ipl::current() <= Ipl::Apc);

	deliver_normal_kernel_apcs(thread);

	loop {
		let apc = {
			let _guard = lock_dispatcher();
			let Some(apc) = thread.apc.user_queue.borrow_mut().pop_front() else {
				return;
			};
			apc
		};

		apc.enqueued.set(false);
		if let Some(normal) = apc.normal_routine {
			normal(&apc, apc.context);
		}
	}
}
