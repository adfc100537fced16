//! Per-CPU scheduling.
//!
//! Every CPU owns ready queues indexed by priority, an idle thread, and a
//! queue of finished threads awaiting teardown. Thread state transitions
//! happen under the dispatcher lock; the queues themselves are only ever
//! touched by their owning CPU at IPL >= `Dpc`, and remote CPUs hand
//! wakeups over through the PRCB's [`SchedulerInput`].
//!
//! The dispatcher lock is held across every context switch: the outgoing
//! context acquires it, the incoming context releases it. A thread
//! returning from [`arch::kernel::switch::switch`] therefore always owns
//! the lock, whether it was just created or is resuming an old block.
//!
//! [`SchedulerInput`]: crate::ke::SchedulerInput

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::mem;

use crate::arch::kernel::switch;
use crate::arch::paging;
use crate::config::{PRIORITY_COUNT, THREAD_QUANTUM_TICKS};
use crate::hal;
use crate::ke::ipl::{self, Ipl};
use crate::ke::thread::{Thread, ThreadStatus};
use crate::ke::wait::{DispatcherGuard, lock_dispatcher, unlock_dispatcher_raw};
use crate::ke::{self, Prcb, process};

/// Ready queues for one CPU: one FIFO per priority plus a bitmap for O(1)
/// highest-priority selection.
pub(crate) struct PriorityThreadQueue {
	queues: [VecDeque<Arc<Thread>>; PRIORITY_COUNT],
	prio_bitmap: u32,
}

impl PriorityThreadQueue {
	pub const fn new() -> Self {
		Self {
			queues: [const { VecDeque::new() }; PRIORITY_COUNT],
			prio_bitmap: 0,
		}
	}

	pub fn push(&mut self, thread: Arc<Thread>) {
		let i = thread.dynamic_priority() as usize;
		self.prio_bitmap |= 1 << i;
		self.queues[i].push_back(thread);
	}

	fn pop_from_queue(&mut self, queue_index: usize) -> Option<Arc<Thread>> {
		let thread = self.queues[queue_index].pop_front();
		if self.queues[queue_index].is_empty() {
			self.prio_bitmap &= !(1 << queue_index);
		}
		thread
	}

	/// Pops the thread with the highest priority.
	pub fn pop(&mut self) -> Option<Arc<Thread>> {
		let highest = self.highest_priority()?;
		self.pop_from_queue(highest as usize)
	}

	pub fn highest_priority(&self) -> Option<u8> {
		if self.prio_bitmap == 0 {
			None
		} else {
			Some((u32::BITS - 1 - self.prio_bitmap.leading_zeros()) as u8)
		}
	}

	pub fn is_empty(&self) -> bool {
		self.prio_bitmap == 0
	}

}

/// Scheduler state of one CPU. Owning CPU only, at IPL >= `Dpc` (or with
/// interrupts disabled during early bring-up and in the idle loop).
pub(crate) struct CpuSched {
	pub ready: PriorityThreadQueue,
	pub current: Option<Arc<Thread>>,
	pub idle: Option<Arc<Thread>>,
	pub finished: VecDeque<Arc<Thread>>,
	/// Thread whose FP state lives in the FPU right now.
	pub fpu_owner: Option<Arc<Thread>>,
}

impl CpuSched {
	pub const fn new() -> Self {
		Self {
			ready: PriorityThreadQueue::new(),
			current: None,
			idle: None,
			finished: VecDeque::new(),
			fpu_owner: None,
		}
	}
}

/// The thread running on this CPU.
pub fn current_thread() -> Arc<Thread> {
	let restore = ipl::disable_interrupts();
	let thread = ke::prcb()
		.sched
		.borrow()
		.current
		.clone()
		.expect("no current thread on this processor yet");
	ipl::restore_interrupts(restore);
	thread
}

/// Turns the executing boot context into this CPU's idle thread.
pub(crate) fn init_current_core(prcb: &'static Prcb) {
	let idle = Thread::adopt_current(process::system_process(), 0);

	let restore = ipl::disable_interrupts();
	{
		let mut sched = prcb.sched.borrow_mut();
		sched.idle = Some(idle.clone());
		sched.current = Some(idle);
	}
	ipl::restore_interrupts(restore);
}

/// Picks the CPU a newly readied thread should run on and queues it there.
///
/// Ties go to the CPU the thread ran on last; other CPUs receive the
/// thread through their input queue and an IPI.
pub(crate) fn ready_thread(thread: Arc<Thread>, _guard: &DispatcherGuard) {
	debug_assert_eq!(thread.status(), ThreadStatus::Ready);

	let affinity = thread.affinity();
	let this = ke::try_prcb();

	let target = {
		let last = thread.last_processor.get();
		let allowed = |id: ke::CoreId| affinity & (1 << id.min(63)) != 0;

		if let Some(prcb) = ke::prcb_by_id(last).filter(|prcb| allowed(prcb.id)) {
			prcb
		} else {
			ke::online_prcbs()
				.into_iter()
				.find(|prcb| allowed(prcb.id))
				.or(this)
				.expect("no processor satisfies the thread's affinity")
		}
	};

	match this {
		Some(this) if this.id == target.id => {
			this.sched.borrow_mut().ready.push(thread);
			// Let the DPC-level dispatch decide whether to preempt.
			ipl::request_software_interrupt(Ipl::Dpc);
		}
		_ => {
			target
				.scheduler_input
				.lock()
				.wakeup_threads
				.push_back(thread);
			hal::request_ipi(
				hal::IpiTarget::Hardware(target.hardware_id),
				ke::dpc_ipi_vector(),
			);
		}
	}
}

/// Folds remotely queued wakeups into the ready queues of this CPU.
fn drain_scheduler_input(prcb: &Prcb) {
	loop {
		let Some(thread) = prcb.scheduler_input.lock().wakeup_threads.pop_front() else {
			return;
		};
		prcb.sched.borrow_mut().ready.push(thread);
	}
}

/// Switches to the highest-priority ready thread.
///
/// Requires the dispatcher lock held, interrupts disabled, IPL `Dpc`. The
/// current thread's status tells the story: `Running` means it competes
/// for the CPU again, anything else means it must leave. Returns when this
/// thread is eventually switched back in — still holding the lock, which
/// the caller (or [`thread_entry`]) releases.
fn reschedule_locked(preempt: bool) {
	let prcb = ke::prcb();
	drain_scheduler_input(prcb);

	let (old_stack_slot, new_stack_pointer) = {
		let mut sched = prcb.sched.borrow_mut();
		let current = sched.current.clone().expect("rescheduling with no thread");

		let next = if current.status() == ThreadStatus::Running {
			let Some(highest) = sched.ready.highest_priority() else {
				return;
			};
			if highest < current.dynamic_priority() {
				return;
			}
			// Equal priority only rotates when the quantum is up.
			if highest == current.dynamic_priority() && !preempt {
				return;
			}

			current.set_status(ThreadStatus::Ready);
			sched.ready.push(current.clone());
			sched.ready.pop().unwrap()
		} else {
			let idle = sched.idle.clone().unwrap();
			sched.ready.pop().unwrap_or(idle)
		};

		if Arc::ptr_eq(&next, &current) {
			next.set_status(ThreadStatus::Running);
			return;
		}

		next.set_status(ThreadStatus::Running);
		next.last_processor.set(prcb.id);
		next.quantum_until
			.set(hal::tick_count() + THREAD_QUANTUM_TICKS * quantum_scale());

		let next_mapping = next.effective_process().page_mapping();
		if next_mapping != paging::current_page_mapping() {
			unsafe {
				paging::switch_page_mapping(next_mapping);
			}
		}

		let old_stack_slot = current.last_stack_pointer.get();
		let new_stack_pointer = unsafe { *next.last_stack_pointer.get() };

		sched.current = Some(next);

		// A terminated thread's frame on this stack would otherwise pin
		// its own Arc forever; the finished queue keeps it alive until
		// the cleanup pass.
		if current.status() == ThreadStatus::Terminated {
			unsafe {
				Arc::decrement_strong_count(Arc::into_raw(current));
			}
		} else {
			drop(current);
		}

		(old_stack_slot, new_stack_pointer)
	};

	unsafe {
		switch::switch(old_stack_slot, new_stack_pointer);
	}
}

/// Ticks per quantum unit, scaled by the tick source frequency so a
/// quantum is on the order of ten milliseconds regardless of the timer.
fn quantum_scale() -> u64 {
	(hal::tick_frequency() / 1000).max(1)
}

/// Parks the current thread (whose status the caller already changed) and
/// runs something else. Consumes the dispatcher guard; the lock stays held
/// across the switch and this thread releases it when it resumes.
pub(crate) fn block_current_and_reschedule(guard: DispatcherGuard) {
	let old_ipl = guard.old_ipl;
	mem::forget(guard);

	let restore = ipl::disable_interrupts();
	reschedule_locked(false);
	unlock_dispatcher_raw();
	ipl::restore_interrupts(restore);
	ipl::lower_if_needed(old_ipl);
}

/// Switches away from a terminated thread; never returns.
pub(crate) fn retire_current_and_reschedule(guard: DispatcherGuard) -> ! {
	mem::forget(guard);

	ipl::disable_interrupts();
	let prcb = ke::prcb();
	{
		let current = current_thread();
		debug_assert_eq!(current.status(), ThreadStatus::Terminated);
		prcb.sched.borrow_mut().finished.push_back(current);
	}

	reschedule_locked(false);
	unreachable!("a terminated thread was switched back in");
}

/// Relinquishes the processor voluntarily.
pub fn yield_current() {
	let thread = current_thread();
	thread.quantum_until.set(0);

	let guard = lock_dispatcher();
	let old_ipl = guard.old_ipl;
	mem::forget(guard);

	let restore = ipl::disable_interrupts();
	reschedule_locked(true);
	unlock_dispatcher_raw();
	ipl::restore_interrupts(restore);
	ipl::lower_if_needed(old_ipl);
}

/// DPC-level scheduler housekeeping, run from the software-interrupt
/// dispatch: fold in remote wakeups, end expired quanta, and preempt if a
/// higher-priority thread became ready.
pub(crate) fn dispatch_deferred_work() {
	let Some(prcb) = ke::try_prcb() else {
		return;
	};

	let restore = ipl::disable_interrupts();
	drain_scheduler_input(prcb);

	let (quantum_expired, should_switch) = {
		let sched = prcb.sched.borrow();
		let Some(current) = sched.current.as_ref() else {
			ipl::restore_interrupts(restore);
			return;
		};

		let quantum_expired = hal::tick_count() >= current.quantum_until.get();
		let higher_ready = sched
			.ready
			.highest_priority()
			.is_some_and(|highest| highest > current.dynamic_priority());
		let any_ready = !sched.ready.is_empty();

		(
			quantum_expired,
			higher_ready || (quantum_expired && any_ready),
		)
	};

	if quantum_expired {
		let current = prcb.sched.borrow().current.clone();
		if let Some(current) = current {
			current.decay_priority_boost();
		}
	}

	if should_switch {
		let guard = lock_dispatcher();
		mem::forget(guard);
		reschedule_locked(quantum_expired);
		unlock_dispatcher_raw();
	}

	ipl::restore_interrupts(restore);
	cleanup_finished(prcb);
}

/// Called by the HAL's interval-timer handler on every tick.
///
/// Runs at the clock IPL, so it only requests the DPC-level dispatch; all
/// real work (timers, quanta, preemption) happens there.
pub fn clock_tick() {
	ipl::request_software_interrupt(Ipl::Dpc);
}

/// Drops threads that finished on this CPU.
fn cleanup_finished(prcb: &Prcb) {
	loop {
		let finished = {
			let restore = ipl::disable_interrupts();
			let thread = prcb.sched.borrow_mut().finished.pop_front();
			ipl::restore_interrupts(restore);
			thread
		};

		match finished {
			Some(thread) => {
				debug!("Dropping finished thread {}", thread.id);
				drop(thread);
			}
			None => return,
		}
	}
}

/// First Rust code of every new thread; reached from the crafted initial
/// stack frame. Releases the dispatcher lock inherited from the switch,
/// drops to `Normal`, and calls the start routine.
pub(crate) extern "C" fn thread_entry(routine: extern "C" fn(usize), argument: usize) -> ! {
	unlock_dispatcher_raw();
	ipl::lower(Ipl::Normal);
	crate::arch::kernel::interrupts::enable();

	routine(argument);

	crate::ke::thread::exit_current_thread()
}

/// Architecture-specific half of the switch, called from the switch
/// assembly once the incoming stack is active: points the TSS at the new
/// thread's kernel stack and arms the lazy FP-state trap unless the FPU
/// already holds this thread's state.
pub(crate) fn set_current_kernel_stack() {
	#[cfg(target_arch = "x86_64")]
	{
		use crate::arch::kernel::processor;

		let prcb = ke::prcb();
		let sched = prcb.sched.borrow();
		if let Some(current) = sched.current.as_ref() {
			let tss = prcb.tss();
			if !tss.is_null() {
				unsafe {
					(*tss).privilege_stack_table[0] =
						x86_64::VirtAddr::new(current.stack.top() as u64);
				}
			}

			let owns_fpu = sched
				.fpu_owner
				.as_ref()
				.is_some_and(|owner| Arc::ptr_eq(owner, current));
			if owns_fpu {
				processor::clear_task_switched();
			} else {
				processor::set_task_switched();
			}
		}
	}
}

/// Swaps the lazily parked FP state in for the current thread.
///
/// Reached through the device-not-available exception: the first FP
/// instruction after a switch to a thread that does not own the FPU.
pub(crate) fn fpu_switch() {
	let prcb = ke::prcb();
	let restore = ipl::disable_interrupts();

	let (current, previous) = {
		let mut sched = prcb.sched.borrow_mut();
		let current = sched.current.clone().expect("FP fault with no thread");
		let previous = sched.fpu_owner.replace(current.clone());
		(current, previous)
	};

	unsafe {
		if let Some(previous) = &previous {
			if !Arc::ptr_eq(previous, &current) {
				(*previous.fpu_state.get()).save();
				(*current.fpu_state.get()).restore();
			}
		} else {
			(*current.fpu_state.get()).restore();
		}
	}

	ipl::restore_interrupts(restore);
}

/// The idle loop every CPU parks in when it has nothing to run.
pub fn idle_loop() -> ! {
	ipl::lower_if_needed(Ipl::Normal);

	loop {
		let prcb = ke::prcb();
		cleanup_finished(prcb);
		// Idle time pre-zeroes free frames so allocations mostly find
		// zeroed ones.
		crate::mm::pfn::lazy_zero_page();
		crate::arch::kernel::processor::enable_interrupts_and_halt();
	}
}
