//! Deferred procedure calls.
//!
//! A DPC is a routine queued for execution at IPL `Dpc` on the processor
//! that enqueued it. Important DPCs go to the head of the queue and force
//! an immediate self-IPI; normal ones run at the next IPL drop.

use alloc::sync::Arc;
use core::cell::Cell;

use crate::ke::ipl::{self, Ipl};
use crate::ke::{self};

pub type DpcRoutine = fn(&Dpc, usize, usize, usize);

pub struct Dpc {
	routine: DpcRoutine,
	context: usize,
	sys_arg1: Cell<usize>,
	sys_arg2: Cell<usize>,
	important: Cell<bool>,
	enqueued: Cell<bool>,
}

// The cells are only touched with interrupts disabled on the owning CPU.
unsafe impl Send for Dpc {}
unsafe impl Sync for Dpc {}

impl Dpc {
	pub fn new(routine: DpcRoutine, context: usize) -> Arc<Self> {
		Arc::new(Self {
			routine,
			context,
			sys_arg1: Cell::new(0),
			sys_arg2: Cell::new(0),
			important: Cell::new(false),
			enqueued: Cell::new(false),
		})
	}

	/// Marks the DPC important. Must happen before it is enqueued; once
	/// queued the routine may already have run and consumed the object.
	pub fn set_important(&self, important: bool) {
		self.important.set(important);
	}

	pub fn context(&self) -> usize {
		self.context
	}
}

/// Queues `dpc` on the executing processor.
///
/// Legal at any IPL; the queue is manipulated with interrupts disabled so
/// an interrupt cannot observe it half-linked.
pub fn enqueue(dpc: &Arc<Dpc>, sys_arg1: usize, sys_arg2: usize) {
	let restore = ipl::disable_interrupts();

	let Some(prcb) = ke::try_prcb() else {
		ipl::restore_interrupts(restore);
		return;
	};

	if dpc.enqueued.replace(true) {
		ipl::restore_interrupts(restore);
		return;
	}

	dpc.sys_arg1.set(sys_arg1);
	dpc.sys_arg2.set(sys_arg2);

	let important = dpc.important.get();
	{
		let mut queue = prcb.dpc_queue.borrow_mut();
		if important {
			queue.push_front(dpc.clone());
		} else {
			queue.push_back(dpc.clone());
		}
	}

	ipl::request_software_interrupt(Ipl::Dpc);
	ipl::restore_interrupts(restore);

	if important {
		ke::issue_software_interrupt();
	}
}

/// Drains this CPU's DPC queue in FIFO order.
///
/// Runs at IPL `Dpc`; each routine is invoked with interrupts enabled.
pub(crate) fn drain_queue() {
	debug_assert_eq!(ipl::current(), Ipl::Dpc);

	loop {
		let restore = ipl::disable_interrupts();
		let next = {
			let Some(prcb) = ke::try_prcb() else {
				ipl::restore_interrupts(restore);
				return;
			};
			prcb.dpc_queue.borrow_mut().pop_front()
		};

		let Some(dpc) = next else {
			ipl::restore_interrupts(restore);
			return;
		};

		dpc.enqueued.set(false);
		ipl::restore_interrupts(restore);

		crate::arch::kernel::interrupts::enable();
		(dpc.routine)(&dpc, dpc.context, dpc.sys_arg1.get(), dpc.sys_arg2.get());
	}
}
