//! The hardware-abstraction-layer vtable.
//!
//! The executive never talks to an interrupt controller, timer, or bus
//! directly; the first HAL driver to come up registers this table exactly
//! once and everything below the executive goes through it. Until then the
//! fallbacks keep early bring-up alive (the TSC stands in as a tick source
//! and end-of-interrupt is a no-op).

use core::sync::atomic::{AtomicPtr, Ordering};

use bitflags::bitflags;

use crate::status::Status;

bitflags! {
	#[derive(Debug, Clone, Copy)]
	pub struct HalFlags: u32 {
		/// The interrupt timer can be programmed as one-shot.
		const ONE_SHOT_TIMER = 1 << 0;
		/// IPIs are delivered by hardware id rather than broadcast only.
		const TARGETED_IPIS = 1 << 1;
	}
}

/// IPI destination selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiTarget {
	/// The requesting processor itself.
	This,
	/// Every processor except the requesting one.
	Others,
	/// One processor, by hardware id.
	Hardware(u32),
}

/// The function table a HAL driver registers via [`set_vtable`].
pub struct HalVtable {
	pub end_of_interrupt: fn(),
	pub request_interrupt_in_ticks: fn(ticks: u64),
	pub request_ipi: fn(target: IpiTarget, vector: u8),
	pub init_system_up: fn() -> Status,
	pub init_system_mp: fn() -> Status,
	pub display_string: fn(&str),
	pub crash_system: fn(&str) -> !,
	pub processor_crashed: fn(),
	pub use_one_shot_int_timer: fn() -> bool,
	pub get_int_timer_frequency: fn() -> u64,
	pub get_int_timer_delta_ticks: fn() -> u64,
	pub get_tick_count: fn() -> u64,
	pub get_tick_frequency: fn() -> u64,
	pub register_interrupt_handler: fn(vector: u8, handler: crate::ke::irq::InterruptHandler),
	pub pic_register: fn(irq: u8, vector: u8) -> Status,
	pub pic_deregister: fn(irq: u8),
	pub pci_read: fn(bus: u8, slot: u8, function: u8, offset: u8) -> u32,
	pub pci_write: fn(bus: u8, slot: u8, function: u8, offset: u8, value: u32),
	pub flags: HalFlags,
}

static VTABLE: AtomicPtr<HalVtable> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the HAL. Called exactly once by the first HAL driver.
pub fn set_vtable(vtable: &'static HalVtable) {
	let previous = VTABLE.swap(
		vtable as *const HalVtable as *mut HalVtable,
		Ordering::AcqRel,
	);
	assert!(
		previous.is_null(),
		"the HAL vtable must only be registered once"
	);
	info!("HAL registered (flags {:?})", vtable.flags);
}

#[inline]
pub(crate) fn try_vtable() -> Option<&'static HalVtable> {
	let raw = VTABLE.load(Ordering::Acquire);
	if raw.is_null() {
		None
	} else {
		Some(unsafe { &*raw })
	}
}

/// Signals completion of the in-service interrupt.
pub fn end_of_interrupt() {
	if let Some(hal) = try_vtable() {
		(hal.end_of_interrupt)();
	}
}

/// Arms the interval timer to fire after `ticks` interrupt-timer ticks.
pub fn request_interrupt_in_ticks(ticks: u64) {
	if let Some(hal) = try_vtable() {
		if hal.flags.contains(HalFlags::ONE_SHOT_TIMER) {
			(hal.request_interrupt_in_ticks)(ticks);
		}
	}
}

pub fn request_self_ipi(vector: u8) {
	if let Some(hal) = try_vtable() {
		(hal.request_ipi)(IpiTarget::This, vector);
	}
}

pub fn request_ipi(target: IpiTarget, vector: u8) {
	if let Some(hal) = try_vtable() {
		(hal.request_ipi)(target, vector);
	}
}

pub(crate) fn broadcast_crash_ipi(vector: u8) {
	if vector == 0 {
		return;
	}
	if let Some(hal) = try_vtable() {
		(hal.request_ipi)(IpiTarget::Others, vector);
	}
}

/// Monotonic tick count. Falls back to the TSC before a HAL exists.
pub fn tick_count() -> u64 {
	match try_vtable() {
		Some(hal) => (hal.get_tick_count)(),
		None => crate::arch::kernel::processor::read_timestamp_counter(),
	}
}

/// Frequency of [`tick_count`] in ticks per second.
pub fn tick_frequency() -> u64 {
	match try_vtable() {
		Some(hal) => (hal.get_tick_frequency)(),
		// A plausible TSC frequency; close enough for the pre-HAL window.
		None => 1_000_000_000,
	}
}

/// Converts milliseconds into timer ticks.
pub fn ms_to_ticks(ms: u64) -> u64 {
	tick_frequency() / 1000 * ms
}
