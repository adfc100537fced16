pub(crate) mod core_local;
pub(crate) mod gdt;
pub(crate) mod interrupts;
pub(crate) mod processor;
mod serial;
pub(crate) mod switch;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::env;

pub fn message_output_init() {
	serial::init();
}

pub fn output_message_buf(buf: &[u8]) {
	serial::write_bytes(buf);
}

/// Console output that bypasses every lock; crash path only.
pub fn output_message_unlocked(buf: &[u8]) {
	unsafe {
		serial::write_bytes_unlocked(buf);
	}
}

/// Early bring-up of the bootstrap processor: CPU features and the IDT.
///
/// Per-CPU state (GDT, TSS, PRCB) is established later by
/// [`crate::ke::add_current_core`].
pub fn boot_processor_init() {
	processor::configure();
	interrupts::install();
	interrupts::load_idt();
}

/// Early bring-up of an application processor.
#[cfg(feature = "smp")]
pub fn application_processor_init() {
	processor::configure();
	interrupts::load_idt();
}

/// Architecture-specific per-CPU setup, called with the PRCB installed.
pub(crate) fn add_current_core() {
	gdt::add_current_core();
}

/// Kicks every application processor listed in the loader block.
///
/// The bootloader parks each AP on a spin loop that watches its trampoline
/// jump slot; storing the entry address releases it.
#[cfg(feature = "smp")]
pub fn boot_application_processors() {
	extern "C" fn ap_entry(_argument: usize) -> ! {
		crate::application_processor_main()
	}

	let mp = &env::loader_block().multiprocessor;
	for processor in mp.list {
		if processor.hardware_id == mp.bootstrap_hardware_id {
			continue;
		}

		debug!(
			"Starting processor {} (hardware id {})",
			processor.processor_id, processor.hardware_id
		);

		let slot = processor.trampoline_jump_address as *const AtomicUsize;
		unsafe {
			(*slot).store(ap_entry as usize, Ordering::Release);
		}
	}
}
