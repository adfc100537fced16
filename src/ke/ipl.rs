//! The interrupt-priority-level discipline.
//!
//! Every CPU carries a single current IPL in its PRCB together with a
//! bitmap of pending software interrupts, one bit per level. Raising only
//! ever goes up, lowering only ever goes down, and lowering past a pending
//! software-interrupt level dispatches that level before returning.
//!
//! Hardware interrupts do not go through [`raise`]/[`lower`]; the trap
//! stubs use [`enter_hardware_interrupt`]/[`exit_hardware_interrupt`]
//! instead.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::arch::kernel::{interrupts, processor};
use crate::ke;

/// Interrupt priority levels, lowest to highest.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Ipl {
	/// Ordinary thread execution.
	Normal = 0,
	/// Asynchronous procedure calls.
	Apc = 1,
	/// Deferred procedure calls and the scheduler.
	Dpc = 2,
	Device0 = 3,
	Device1 = 4,
	Device2 = 5,
	Device3 = 6,
	Device4 = 7,
	Device5 = 8,
	Device6 = 9,
	Device7 = 10,
	Device8 = 11,
	Device9 = 12,
	/// The interval timer.
	Clock = 13,
	/// Inter-processor interrupts.
	Ipi = 14,
	/// Nothing below this is deliverable; crash and shootdown traffic only.
	NoInts = 15,
}

pub const IPL_COUNT: usize = 16;

/// Lets the interrupt controller know about an IPL change.
///
/// Must happen *before* the PRCB is updated when raising and *after* it
/// when lowering, so the controller never allows a vector the PRCB claims
/// to be masked.
#[inline]
fn on_update(new: Ipl) {
	processor::set_task_priority(new.into());
}

/// The current IPL of this processor.
pub fn current() -> Ipl {
	let restore = disable_interrupts();
	let ipl = match ke::try_prcb() {
		Some(prcb) => prcb.ipl(),
		None => Ipl::Normal,
	};
	restore_interrupts(restore);
	ipl
}

/// Disables interrupt delivery, returning whether it was enabled.
#[inline]
pub fn disable_interrupts() -> bool {
	if cfg!(target_os = "none") {
		let was_enabled = interrupts::are_enabled();
		interrupts::disable();
		was_enabled
	} else {
		false
	}
}

/// Restores the interrupt state saved by [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
	if was_enabled {
		interrupts::enable();
	}
}

/// Raises the IPL to `new`, which must not be below the current level.
pub fn raise(new: Ipl) -> Ipl {
	let restore = disable_interrupts();

	let Some(prcb) = ke::try_prcb() else {
		// Too early for a PRCB; IPL is effectively NoInts here.
		restore_interrupts(restore);
		return new;
	};

	let old = prcb.ipl();
	if old == new {
		restore_interrupts(restore);
		return old;
	}

	if old > new {
		ke::crash(format_args!(
			"attempt to raise the IPL downwards ({old:?} -> {new:?})"
		));
	}

	on_update(new);
	prcb.set_ipl(new);

	restore_interrupts(restore);
	old
}

/// Raises the IPL to `new` if it is above the current level; never lowers.
pub fn raise_if_needed(new: Ipl) -> Ipl {
	let restore = disable_interrupts();

	let Some(prcb) = ke::try_prcb() else {
		restore_interrupts(restore);
		return new;
	};

	let old = prcb.ipl();
	if new > old {
		on_update(new);
		prcb.set_ipl(new);
	}

	restore_interrupts(restore);
	old
}

/// Lowers the IPL to `new`, dispatching any pending software interrupts
/// above the new level before returning.
pub fn lower(new: Ipl) -> Ipl {
	let restore = disable_interrupts();

	let Some(prcb) = ke::try_prcb() else {
		restore_interrupts(restore);
		return new;
	};

	let old = prcb.ipl();
	if old == new {
		restore_interrupts(restore);
		return old;
	}

	if old < new {
		ke::crash(format_args!(
			"attempt to lower the IPL upwards ({old:?} -> {new:?})"
		));
	}

	prcb.set_ipl(new);
	on_update(new);

	restore_interrupts(restore);

	if prcb.pending_soft_interrupts() >> (u8::from(new) + 1) != 0 {
		dispatch_software_interrupts(new);
	}

	old
}

/// Lowers to `new` only if the current level is above it.
pub fn lower_if_needed(new: Ipl) {
	if current() > new {
		lower(new);
	}
}

/// Marks a software interrupt of the given level pending on this CPU.
///
/// It runs once the IPL drops below `level`; [`ke::issue_software_interrupt`]
/// additionally pokes the CPU with a self-IPI so the drop happens promptly.
pub fn request_software_interrupt(level: Ipl) {
	debug_assert!(level == Ipl::Apc || level == Ipl::Dpc);

	let restore = disable_interrupts();
	if let Some(prcb) = ke::try_prcb() {
		prcb.set_pending_soft_interrupt(level);
	}
	restore_interrupts(restore);
}

/// Runs pending software interrupts above `floor`, highest level first.
///
/// Each level's pending bit is cleared exactly when that level is
/// dispatched, so a handler re-requesting its own level re-arms it without
/// recursion.
pub(crate) fn dispatch_software_interrupts(floor: Ipl) {
	let floor = u8::from(floor);
	if floor as usize >= IPL_COUNT - 1 {
		return;
	}

	loop {
		let restore = disable_interrupts();
		let Some(prcb) = ke::try_prcb() else {
			restore_interrupts(restore);
			return;
		};

		let pending = prcb.pending_soft_interrupts() >> (floor + 1) << (floor + 1);
		let Some(level_bit) = (u16::BITS - 1).checked_sub(pending.leading_zeros()) else {
			restore_interrupts(restore);
			return;
		};

		let level = Ipl::try_from(level_bit as u8).unwrap();
		prcb.clear_pending_soft_interrupt(level);

		let entry_ipl = prcb.ipl();
		prcb.set_ipl(level);
		on_update(level);
		restore_interrupts(restore);

		// The handlers run with interrupts enabled at their own level.
		interrupts::enable();
		match level {
			Ipl::Dpc => {
				ke::timer::dispatch_expired_timers();
				ke::dpc::drain_queue();
				ke::sched::dispatch_deferred_work();
			}
			Ipl::Apc => {
				ke::apc::deliver_kernel_apcs();
			}
			_ => {}
		}

		let restore = disable_interrupts();
		if let Some(prcb) = ke::try_prcb() {
			prcb.set_ipl(entry_ipl);
			on_update(entry_ipl);
		}
		restore_interrupts(restore);
	}
}
