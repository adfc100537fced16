//! The thread dispatcher object.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::{Cell, RefCell, UnsafeCell};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::kernel::switch;
use crate::config::{KERNEL_STACK_SIZE, PRIORITY_COUNT};
use crate::ke::apc::ThreadApcState;
use crate::ke::process::Process;
use crate::ke::timer::Timer;
use crate::ke::wait::{
	Dispatch, DispatchHeader, DispatcherGuard, ObjectKind, WaitState, lock_dispatcher,
	unwait_thread, wait_test,
};
use crate::ke::{self, CoreId, sched};
use crate::status::{KeStatus, Status};

pub type ThreadId = u64;
pub type Affinity = u64;

pub type ThreadStartRoutine = extern "C" fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
	Uninitialized,
	Initialized,
	Ready,
	Running,
	Waiting,
	Terminated,
}

/// The kernel stack of a thread.
pub(crate) struct ThreadStack {
	memory: Box<[u8]>,
}

impl ThreadStack {
	fn new() -> Self {
		Self {
			memory: vec![0; KERNEL_STACK_SIZE].into_boxed_slice(),
		}
	}

	pub(crate) fn top(&self) -> usize {
		let base = self.memory.as_ptr() as usize;
		align_down!(base + self.memory.len(), 16)
	}
}

/// The thread object.
///
/// Scheduling state (status, priority, quantum, wait state) is guarded by
/// the dispatcher lock; the saved stack pointer is only touched by the
/// context switch with that lock held.
pub struct Thread {
	header: DispatchHeader,
	pub id: ThreadId,
	pub process: Arc<Process>,

	pub(crate) stack: ThreadStack,
	/// Stack pointer at the last switch away from this thread.
	pub(crate) last_stack_pointer: UnsafeCell<usize>,

	status: Cell<ThreadStatus>,
	base_priority: Cell<u8>,
	priority_boost: Cell<u8>,
	affinity: Cell<Affinity>,
	pub(crate) quantum_until: Cell<u64>,
	pub(crate) last_processor: Cell<CoreId>,
	pending_termination: Cell<bool>,

	pub(crate) wait: RefCell<WaitState>,
	/// Backs wait timeouts; one per thread, rearmed for every timed wait.
	pub(crate) wait_timer: Arc<Timer>,
	pub(crate) apc: ThreadApcState,

	/// FP and SIMD state, swapped lazily on first use after a switch.
	pub(crate) fpu_state: UnsafeCell<crate::arch::kernel::processor::FpuState>,

	/// Address space this thread is temporarily attached to, if any.
	attached_process: RefCell<Option<Arc<Process>>>,
}

// All mutable state is guarded by the dispatcher lock (or, for the saved
// stack pointer, by the context switch itself).
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

impl Thread {
	/// Creates a thread of `process` in the `Initialized` state; it starts
	/// running once [`ready`](Self::ready) is called.
	pub fn create(
		process: &Arc<Process>,
		start_routine: ThreadStartRoutine,
		start_context: usize,
	) -> Status<Arc<Thread>> {
		let stack = ThreadStack::new();
		let stack_pointer =
			switch::create_initial_stack_frame(stack.top(), start_routine, start_context);

		let thread = Arc::new(Thread {
			header: DispatchHeader::new(ObjectKind::Thread, 0),
			id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
			process: process.clone(),
			stack,
			last_stack_pointer: UnsafeCell::new(stack_pointer),
			status: Cell::new(ThreadStatus::Initialized),
			base_priority: Cell::new(process.default_priority()),
			priority_boost: Cell::new(0),
			affinity: Cell::new(process.default_affinity()),
			quantum_until: Cell::new(0),
			last_processor: Cell::new(ke::core_id()),
			pending_termination: Cell::new(false),
			wait: RefCell::new(WaitState::new()),
			wait_timer: Arc::new(Timer::new()),
			apc: ThreadApcState::new(),
			fpu_state: UnsafeCell::new(crate::arch::kernel::processor::FpuState::new()),
			attached_process: RefCell::new(None),
		});

		process.attach_thread(&thread);
		Ok(thread)
	}

	/// Bootstraps a thread object around an already-running context (the
	/// boot flow of each CPU, which becomes its idle thread).
	pub(crate) fn adopt_current(process: &Arc<Process>, priority: u8) -> Arc<Thread> {
		let thread = Arc::new(Thread {
			header: DispatchHeader::new(ObjectKind::Thread, 0),
			id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
			process: process.clone(),
			stack: ThreadStack::new(),
			last_stack_pointer: UnsafeCell::new(0),
			status: Cell::new(ThreadStatus::Running),
			base_priority: Cell::new(priority),
			priority_boost: Cell::new(0),
			affinity: Cell::new(Affinity::MAX),
			quantum_until: Cell::new(u64::MAX),
			last_processor: Cell::new(ke::core_id()),
			pending_termination: Cell::new(false),
			wait: RefCell::new(WaitState::new()),
			wait_timer: Arc::new(Timer::new()),
			apc: ThreadApcState::new(),
			fpu_state: UnsafeCell::new(crate::arch::kernel::processor::FpuState::new()),
			attached_process: RefCell::new(None),
		});

		process.attach_thread(&thread);
		thread
	}

	/// Makes an `Initialized` thread eligible to run.
	pub fn ready(self: &Arc<Thread>) {
		let guard = lock_dispatcher();
		assert_eq!(self.status(), ThreadStatus::Initialized);
		self.set_status(ThreadStatus::Ready);
		sched::ready_thread(self.clone(), &guard);
	}

	pub fn status(&self) -> ThreadStatus {
		self.status.get()
	}

	pub(crate) fn set_status(&self, status: ThreadStatus) {
		self.status.set(status);
	}

	pub fn base_priority(&self) -> u8 {
		self.base_priority.get()
	}

	/// Priority used for ready-queue placement: the base plus any
	/// unconsumed wake boost.
	pub(crate) fn dynamic_priority(&self) -> u8 {
		(self.base_priority.get() + self.priority_boost.get()).min(PRIORITY_COUNT as u8 - 1)
	}

	pub fn set_priority(&self, priority: u8) {
		let _guard = lock_dispatcher();
		self.base_priority.set(priority.min(PRIORITY_COUNT as u8 - 1));
	}

	pub(crate) fn apply_priority_boost(&self, boost: u8) {
		if boost > self.priority_boost.get() {
			self.priority_boost.set(boost);
		}
	}

	/// The wake boost decays when the thread exhausts a quantum.
	pub(crate) fn decay_priority_boost(&self) {
		self.priority_boost.set(0);
	}

	pub fn affinity(&self) -> Affinity {
		self.affinity.get()
	}

	pub fn set_affinity(&self, affinity: Affinity) -> Status {
		if affinity == 0 {
			return Err(KeStatus::InvalidParameter);
		}
		let _guard = lock_dispatcher();
		self.affinity.set(affinity);
		Ok(())
	}

	pub fn pending_termination(&self) -> bool {
		self.pending_termination.get()
	}

	/// The process whose address space this thread currently uses.
	pub fn effective_process(&self) -> Arc<Process> {
		self.attached_process
			.borrow()
			.clone()
			.unwrap_or_else(|| self.process.clone())
	}

	/// Attaches the current thread to another process's address space.
	/// Returns the previously attached process.
	pub fn set_attached_process(
		self: &Arc<Thread>,
		process: Option<Arc<Process>>,
	) -> Option<Arc<Process>> {
		let _guard = lock_dispatcher();
		let old = self.attached_process.replace(process);
		let target = self.effective_process();
		unsafe {
			target.switch_to_address_space();
		}
		old
	}

	/// Marks `thread` for termination.
	///
	/// A thread parked in an alertable wait unblocks with
	/// [`KeStatus::Killed`]; otherwise the flag is honored at the next
	/// termination check.
	pub fn terminate(self: &Arc<Thread>) {
		let guard = lock_dispatcher();
		self.pending_termination.set(true);

		if self.status() == ThreadStatus::Waiting && self.wait.borrow().alertable {
			unwait_thread(self, Err(KeStatus::Killed), 1, &guard);
		}
	}
}

impl Dispatch for Thread {
	fn header(&self) -> &DispatchHeader {
		&self.header
	}
}

/// Ends the calling thread: signals its header (releasing joiners),
/// retires it from its process, and switches away for good.
pub fn exit_current_thread() -> ! {
	let thread = sched::current_thread();
	debug!("Thread {} exiting", thread.id);

	let guard = lock_dispatcher();

	thread.set_status(ThreadStatus::Terminated);
	thread.header.set_signaled(1, &guard);
	wait_test(&*thread, 0, &guard);

	thread.process.retire_thread(&thread, &guard);

	drop(thread);
	sched::retire_current_and_reschedule(guard)
}

/// Terminates the calling thread after an unrecoverable user-mode fault.
pub(crate) fn terminate_current_for_fault() -> ! {
	exit_current_thread()
}
