//! Dispatcher objects and waits.
//!
//! Every waitable object embeds a [`DispatchHeader`]: a type tag, a
//! signaled count, and the list of waiting threads. One process-wide spin
//! lock — the *dispatcher lock*, held at IPL >= `Dpc` — guards the headers
//! of all objects, the wait state of all threads, and the timer queues.
//! Holding it is witnessed by a [`DispatcherGuard`], which the `*_locked`
//! entry points take by reference; there is exactly one dispatcher lock,
//! so no two of them can ever nest.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::{Cell, RefCell};
use core::marker::PhantomData;

use smallvec::SmallVec;

use crate::config::{MAXIMUM_WAIT_BLOCKS, THREAD_WAIT_BLOCKS};
use crate::ke::ipl::{self, Ipl};
use crate::ke::spinlock::RawSpin;
use crate::ke::thread::{Thread, ThreadStatus};
use crate::ke::{apc, sched, timer};
use crate::status::KeStatus;

/// The process-wide dispatcher lock.
static DISPATCHER_LOCK: RawSpin = RawSpin::new();

/// Witness that the dispatcher lock is held by the current context.
///
/// Dropping it releases the lock and restores the IPL.
pub struct DispatcherGuard {
	pub(crate) old_ipl: Ipl,
	_not_send: PhantomData<*mut ()>,
}

pub(crate) fn lock_dispatcher() -> DispatcherGuard {
	let old_ipl = ipl::raise_if_needed(Ipl::Dpc);
	DISPATCHER_LOCK.lock();
	DispatcherGuard {
		old_ipl,
		_not_send: PhantomData,
	}
}

impl Drop for DispatcherGuard {
	fn drop(&mut self) {
		DISPATCHER_LOCK.unlock();
		ipl::lower_if_needed(self.old_ipl);
	}
}

/// Releases the raw lock without adjusting the IPL; the context-switch path
/// hands lock ownership from the outgoing to the incoming thread and the
/// incoming side calls this.
pub(crate) fn unlock_dispatcher_raw() {
	DISPATCHER_LOCK.unlock();
}

pub(crate) fn assert_dispatcher_locked() {
	debug_assert!(DISPATCHER_LOCK.is_locked());
}

/// Type tag of a dispatcher object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
	Event,
	Mutex,
	Semaphore,
	Timer,
	Thread,
	Process,
}

/// Embedded first member of every waitable object.
pub struct DispatchHeader {
	kind: ObjectKind,
	/// Meaning depends on the kind: 0/1 for events and timers, a count for
	/// semaphores, `MUTEX_SIGNALED - depth` for mutexes, termination state
	/// for threads and processes.
	signaled: Cell<i32>,
	/// Waiting threads in FIFO order.
	wait_list: RefCell<VecDeque<Arc<Thread>>>,
}

// All mutable state is only reached under the dispatcher lock.
unsafe impl Send for DispatchHeader {}
unsafe impl Sync for DispatchHeader {}

impl DispatchHeader {
	pub(crate) const fn new(kind: ObjectKind, signaled: i32) -> Self {
		Self {
			kind,
			signaled: Cell::new(signaled),
			wait_list: RefCell::new(VecDeque::new()),
		}
	}

	pub(crate) fn kind(&self) -> ObjectKind {
		self.kind
	}

	pub(crate) fn signaled(&self, _guard: &DispatcherGuard) -> i32 {
		self.signaled.get()
	}

	pub(crate) fn set_signaled(&self, value: i32, _guard: &DispatcherGuard) {
		self.signaled.set(value);
	}

	/// Unsynchronized peek at the signal state, for the `read_state`
	/// surface only; any decision making must happen under the lock.
	pub(crate) fn read_state(&self) -> i32 {
		self.signaled.get()
	}

	pub(crate) fn enqueue_waiter(&self, thread: Arc<Thread>, _guard: &DispatcherGuard) {
		self.wait_list.borrow_mut().push_back(thread);
	}

	pub(crate) fn remove_waiter(&self, thread: &Arc<Thread>, _guard: &DispatcherGuard) {
		self.wait_list
			.borrow_mut()
			.retain(|waiter| !Arc::ptr_eq(waiter, thread));
	}

}

/// A waitable object.
///
/// The default satisfiability test and acquire side effect fit events,
/// timers, threads, and processes; mutexes and semaphores override them.
pub trait Dispatch: Send + Sync {
	fn header(&self) -> &DispatchHeader;

	/// Whether a wait by `thread` would be satisfied right now.
	fn satisfiable(&self, _thread: &Thread, guard: &DispatcherGuard) -> bool {
		self.header().signaled(guard) != 0
	}

	/// Applies the acquire side effect for `thread`.
	fn acquire(&self, _thread: &Arc<Thread>, _guard: &DispatcherGuard) {}
}

/// Index marking the wait block of the built-in timeout timer.
pub(crate) const TIMEOUT_INDEX: usize = usize::MAX;

/// One (thread, object) edge of a wait.
///
/// The raw object pointer stays valid for the whole wait: the waiter's
/// caller keeps the objects alive for at least as long as the wait lasts,
/// and the block is discarded under the dispatcher lock before the wait
/// returns.
pub(crate) struct WaitBlock {
	pub object: *const dyn Dispatch,
	pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
	/// Return when any one object is signaled.
	Any,
	/// Return when all objects are signaled simultaneously.
	All,
}

pub(crate) struct WaitState {
	pub blocks: SmallVec<[WaitBlock; THREAD_WAIT_BLOCKS]>,
	pub kind: WaitKind,
	pub alertable: bool,
	pub result: Option<Result<usize, KeStatus>>,
}

impl WaitState {
	pub(crate) fn new() -> Self {
		Self {
			blocks: SmallVec::new(),
			kind: WaitKind::Any,
			alertable: false,
			result: None,
		}
	}
}

fn block_matches(block: &WaitBlock, object: &dyn Dispatch) -> bool {
	let block_header = unsafe { (*block.object).header() } as *const DispatchHeader;
	core::ptr::eq(block_header, object.header())
}

/// Whether `thread`'s wait is satisfied, given that `object` just became
/// signaled. Returns the wait result to deliver, or `None`.
fn wait_satisfied(
	thread: &Thread,
	object: &dyn Dispatch,
	guard: &DispatcherGuard,
) -> Option<Result<usize, KeStatus>> {
	let wait = thread.wait.borrow();

	let matching = wait.blocks.iter().find(|block| block_matches(block, object))?;

	// The built-in timeout breaks the wait no matter its kind.
	if matching.index == TIMEOUT_INDEX {
		return Some(Err(KeStatus::Timeout));
	}

	match wait.kind {
		WaitKind::Any => Some(Ok(matching.index)),
		WaitKind::All => {
			let all = wait
				.blocks
				.iter()
				.filter(|block| block.index != TIMEOUT_INDEX)
				.all(|block| unsafe { (*block.object).satisfiable(thread, guard) });
			all.then_some(Ok(0))
		}
	}
}

/// Takes `thread` out of its wait: removes it from every wait list it is
/// linked into, records the wait result, and makes it ready.
pub(crate) fn unwait_thread(
	thread: &Arc<Thread>,
	result: Result<usize, KeStatus>,
	boost: u8,
	guard: &DispatcherGuard,
) {
	let blocks = {
		let mut wait = thread.wait.borrow_mut();
		wait.result = Some(result);
		core::mem::take(&mut wait.blocks)
	};

	for block in &blocks {
		let object = unsafe { &*block.object };
		object.header().remove_waiter(thread, guard);
	}

	timer::cancel_timer_locked(&thread.wait_timer, guard);

	thread.apply_priority_boost(boost);
	thread.set_status(ThreadStatus::Ready);
	sched::ready_thread(thread.clone(), guard);
}

/// Walks `object`'s wait list after its signal state changed and releases
/// every waiter whose wait is now satisfied, applying acquire side effects
/// as it goes. Returns the first thread released, which the event handoff
/// paths use.
pub(crate) fn wait_test(
	object: &dyn Dispatch,
	boost: u8,
	guard: &DispatcherGuard,
) -> Option<Arc<Thread>> {
	assert_dispatcher_locked();

	let mut first_woken = None;

	let mut index = 0;
	loop {
		let Some(thread) = object.header().wait_list.borrow().get(index).cloned() else {
			break;
		};

		// Acquire side effects may consume the signal (synchronization
		// events, semaphores with a drained count); stop as soon as the
		// object can no longer satisfy the next waiter in line.
		if !object.satisfiable(&thread, guard) {
			break;
		}

		let Some(result) = wait_satisfied(&thread, object, guard) else {
			index += 1;
			continue;
		};

		match result {
			Ok(_) => {
				let wait_kind = thread.wait.borrow().kind;
				match wait_kind {
					WaitKind::Any => object.acquire(&thread, guard),
					WaitKind::All => {
						// Acquire everything, atomically, in array order.
						let blocks: SmallVec<[*const dyn Dispatch; THREAD_WAIT_BLOCKS]> = thread
							.wait
							.borrow()
							.blocks
							.iter()
							.filter(|block| block.index != TIMEOUT_INDEX)
							.map(|block| block.object)
							.collect();
						for object in blocks {
							unsafe { (*object).acquire(&thread, guard) };
						}
					}
				}
			}
			Err(_) => {}
		}

		unwait_thread(&thread, result, boost, guard);
		first_woken.get_or_insert(thread);
		// The satisfied thread vanished from the list; the same index now
		// names the next waiter.
	}

	first_woken
}

/// Waits until one of (or all of) `objects` become signaled.
///
/// A `timeout` of `None` waits forever and `Some(0)` merely polls. With
/// `alertable`, delivery of a user APC breaks the wait with
/// [`KeStatus::Alerted`] and a pending termination breaks it with
/// [`KeStatus::Killed`]. On success the index of the satisfying object is
/// returned (0 for an all-wait).
pub(crate) fn wait_for_multiple(
	objects: &[&dyn Dispatch],
	kind: WaitKind,
	alertable: bool,
	timeout: Option<u64>,
) -> Result<usize, KeStatus> {
	let guard = lock_dispatcher();
	wait_for_multiple_locked(objects, kind, alertable, timeout, guard)
}

/// The wait engine proper. Takes the dispatcher lock already held, which
/// is how a signal and an immediately following wait compose atomically:
/// the signaling operation runs `*_locked` under the guard and hands it
/// straight in here.
pub(crate) fn wait_for_multiple_locked(
	objects: &[&dyn Dispatch],
	kind: WaitKind,
	alertable: bool,
	timeout: Option<u64>,
	guard: DispatcherGuard,
) -> Result<usize, KeStatus> {
	if objects.is_empty() || objects.len() > MAXIMUM_WAIT_BLOCKS {
		return Err(KeStatus::InvalidParameter);
	}
	debug_assert!(guard.old_ipl <= Ipl::Apc);

	let thread = sched::current_thread();

	if alertable {
		if thread.pending_termination() {
			return Err(KeStatus::Killed);
		}
		if apc::user_apcs_pending(&thread, &guard) {
			drop(guard);
			apc::deliver_user_apcs(&thread);
			return Err(KeStatus::Alerted);
		}
	}

	// Immediate satisfaction without ever blocking.
	match kind {
		WaitKind::Any => {
			for (index, object) in objects.iter().enumerate() {
				if object.satisfiable(&thread, &guard) {
					object.acquire(&thread, &guard);
					return Ok(index);
				}
			}
		}
		WaitKind::All => {
			if objects
				.iter()
				.all(|object| object.satisfiable(&thread, &guard))
			{
				for object in objects {
					object.acquire(&thread, &guard);
				}
				return Ok(0);
			}
		}
	}

	if timeout == Some(0) {
		return Err(KeStatus::Timeout);
	}

	// Arm the wait blocks and link into the wait lists.
	{
		let mut wait = thread.wait.borrow_mut();
		wait.kind = kind;
		wait.alertable = alertable;
		wait.result = None;
		wait.blocks = objects
			.iter()
			.enumerate()
			.map(|(index, object)| WaitBlock {
				object: *object as *const dyn Dispatch,
				index,
			})
			.collect();
	}
	for object in objects {
		object.header().enqueue_waiter(thread.clone(), &guard);
	}

	if let Some(ms) = timeout {
		let wait_timer = thread.wait_timer.clone();
		timer::set_timer_locked(&wait_timer, ms, None, &guard);
		thread.wait.borrow_mut().blocks.push(WaitBlock {
			object: &*wait_timer as *const dyn Dispatch,
			index: TIMEOUT_INDEX,
		});
		wait_timer
			.header()
			.enqueue_waiter(thread.clone(), &guard);
	}

	thread.set_status(ThreadStatus::Waiting);
	sched::block_current_and_reschedule(guard);

	// Back from the wait; the waker filled in the result and removed us
	// from every wait list before readying us.
	let result = thread
		.wait
		.borrow_mut()
		.result
		.take()
		.expect("woken from a wait without a result");

	if alertable && result.is_ok() {
		apc::deliver_user_apcs(&thread);
	}

	result
}

/// Waits for a single object; see [`wait_for_multiple`].
pub(crate) fn wait_for_single(
	object: &dyn Dispatch,
	alertable: bool,
	timeout: Option<u64>,
) -> Result<(), KeStatus> {
	wait_for_multiple(&[object], WaitKind::Any, alertable, timeout).map(|_| ())
}

/// Public single-object wait over the executive object surface.
pub fn wait_for_single_object(
	object: &dyn crate::ob::Waitable,
	alertable: bool,
	timeout: Option<u64>,
) -> Result<(), KeStatus> {
	wait_for_single(object.dispatch(), alertable, timeout)
}

/// Public multi-object wait over the executive object surface.
pub fn wait_for_multiple_objects(
	objects: &[&dyn crate::ob::Waitable],
	kind: WaitKind,
	alertable: bool,
	timeout: Option<u64>,
) -> Result<usize, KeStatus> {
	let dispatches: SmallVec<[&dyn Dispatch; THREAD_WAIT_BLOCKS]> =
		objects.iter().map(|object| object.dispatch()).collect();
	wait_for_multiple(&dispatches, kind, alertable, timeout)
}
