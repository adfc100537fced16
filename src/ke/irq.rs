//! Interrupt-vector bookkeeping and the generic trap pipeline.
//!
//! The 256 vectors are split into 16 buckets of 16, one bucket per IPL;
//! a vector's upper four bits are its priority class, which is what the
//! task-priority register masks against. Vector allocation hands out the
//! next free slot in the requested bucket.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use hermit_sync::InterruptTicketMutex;

use crate::config::VECTORS_PER_IPL;
use crate::hal;
use crate::ke::ipl::{self, IPL_COUNT, Ipl};
use crate::ke::{self, Prcb};

pub type InterruptHandler = fn(u8);

const VECTOR_COUNT: usize = IPL_COUNT * VECTORS_PER_IPL;

/// Registered handlers; zero means unregistered.
static HANDLERS: [AtomicUsize; VECTOR_COUNT] =
	[const { AtomicUsize::new(0) }; VECTOR_COUNT];

/// Per-vector IPL overrides; by default a vector's IPL is its bucket.
static VECTOR_IPL: [AtomicU8; VECTOR_COUNT] = {
	const INIT: AtomicU8 = AtomicU8::new(u8::MAX);
	[INIT; VECTOR_COUNT]
};

/// Allocation bitmap, one word per bucket.
static ALLOCATED: InterruptTicketMutex<[u16; IPL_COUNT]> =
	InterruptTicketMutex::new([0; IPL_COUNT]);

/// Reserves the next free vector in the bucket belonging to `ipl`.
///
/// Exception vectors 0..32 (the first two buckets) are owned by the CPU
/// and never handed out.
pub fn allocate_vector(ipl: Ipl) -> Option<u8> {
	let bucket = u8::from(ipl) as usize;
	if bucket < 2 {
		return None;
	}

	let mut allocated = ALLOCATED.lock();
	let free = (!allocated[bucket]).trailing_zeros() as usize;
	if free >= VECTORS_PER_IPL {
		return None;
	}

	allocated[bucket] |= 1 << free;
	Some((bucket * VECTORS_PER_IPL + free) as u8)
}

pub fn register_handler(vector: u8, handler: InterruptHandler) {
	debug!("Registering handler for interrupt vector {vector}");
	HANDLERS[vector as usize].store(handler as usize, Ordering::Release);
}

/// Overrides the IPL a vector dispatches at.
pub fn set_vector_ipl(vector: u8, ipl: Ipl) {
	VECTOR_IPL[vector as usize].store(ipl.into(), Ordering::Release);
}

pub(crate) fn vector_ipl(vector: u8) -> Ipl {
	let overridden = VECTOR_IPL[vector as usize].load(Ordering::Acquire);
	if overridden != u8::MAX {
		Ipl::try_from(overridden).unwrap()
	} else {
		Ipl::try_from(vector >> 4).unwrap()
	}
}

fn handler_for(vector: u8) -> Option<InterruptHandler> {
	let raw = HANDLERS[vector as usize].load(Ordering::Acquire);
	if raw == 0 {
		None
	} else {
		Some(unsafe { core::mem::transmute::<usize, InterruptHandler>(raw) })
	}
}

/// Raises the IPL for an incoming hardware interrupt.
pub fn enter_hardware_interrupt(new: Ipl) -> Ipl {
	let prcb = ke::prcb();
	let old = prcb.ipl();
	crate::arch::kernel::processor::set_task_priority(new.into());
	prcb.set_ipl(new);
	old
}

/// Unwinds a hardware interrupt: replays deferred interrupts that are now
/// deliverable, lowers back to `old`, and dispatches any pending software
/// interrupts before the return to the interrupted context.
pub fn exit_hardware_interrupt(old: Ipl) {
	let prcb = ke::prcb();

	replay_deferred_interrupts(prcb, old);

	prcb.set_ipl(old);
	crate::arch::kernel::processor::set_task_priority(old.into());

	let floor = u8::from(old);
	if (floor as usize) < IPL_COUNT - 1 && prcb.pending_soft_interrupts() >> (floor + 1) != 0 {
		ipl::dispatch_software_interrupts(old);
	}
}

fn replay_deferred_interrupts(prcb: &Prcb, floor: Ipl) {
	loop {
		let Some(vector) = prcb.pop_deferred_interrupt(floor) else {
			return;
		};

		let target = vector_ipl(vector);
		prcb.set_ipl(target);
		crate::arch::kernel::processor::set_task_priority(target.into());

		match handler_for(vector) {
			Some(handler) => handler(vector),
			None => unknown_interrupt(vector),
		}
	}
}

/// The generic trap target for all non-exception vectors.
///
/// On controllers that cannot enforce vector priority in hardware an
/// interrupt at or below the current IPL can slip in; it is parked on the
/// deferred queue and replayed from [`exit_hardware_interrupt`] of the
/// outer frame.
pub(crate) fn dispatch_interrupt(vector: u8) {
	let Some(prcb) = ke::try_prcb() else {
		ke::crash(format_args!(
			"interrupt vector {vector} arrived before the PRCB was installed"
		));
	};

	prcb.increment_interrupt_counter(vector);

	let target = vector_ipl(vector);
	if target <= prcb.ipl() {
		prcb.defer_interrupt(vector);
		hal::end_of_interrupt();
		return;
	}

	let old = enter_hardware_interrupt(target);

	match handler_for(vector) {
		Some(handler) => handler(vector),
		None => unknown_interrupt(vector),
	}

	exit_hardware_interrupt(old);
}

fn unknown_interrupt(vector: u8) -> ! {
	ke::crash(format_args!("unknown interrupt on vector {vector}"))
}
