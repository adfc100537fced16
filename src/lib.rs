#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::new_without_default)]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]
#![no_std]

//! The Boron kernel executive.
//!
//! This crate implements the tightly coupled core of the kernel: the
//! interrupt-priority-level (IPL) discipline, the dispatcher objects and the
//! scheduler built on them, deferred and asynchronous procedure calls, the
//! executive read/writer lock, the virtual-memory manager (page-frame
//! database, page tables, address descriptors, sections, overlays, the page
//! fault handler and the modified-page writer), the object manager, and the
//! slice of the I/O core the paging path consumes.
//!
//! Everything below the executive (interrupt controllers, timers, buses,
//! file systems) reaches the kernel through the [`hal`] vtable and the
//! [`io`] dispatch tables.

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;

use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(target_os = "none")]
use hermit_sync::RawInterruptTicketMutex;
#[cfg(target_os = "none")]
use talc::{ClaimOnOom, Span, Talc, Talck};

pub use crate::config::*;
pub use crate::env::LoaderBlock;
pub use crate::status::KeStatus;
pub use crate::syscalls::*;

#[macro_use]
mod macros;

#[macro_use]
mod logging;

pub mod arch;
mod config;
mod console;
pub mod env;
pub mod ex;
pub mod hal;
pub mod io;
pub mod ke;
pub mod mm;
pub mod ob;
#[cfg(target_os = "none")]
mod runtime_glue;
mod status;
pub mod syscalls;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: Talck<RawInterruptTicketMutex, ClaimOnOom> =
	Talc::new(unsafe { ClaimOnOom::new(Span::empty()) }).lock();

/// Hands a span of boot memory to the kernel heap.
///
/// Called once per contiguous region by [`mm::init`] before the first
/// allocation is made.
#[cfg(target_os = "none")]
pub(crate) unsafe fn claim_heap_region(base: *mut u8, size: usize) {
	unsafe {
		ALLOCATOR
			.lock()
			.claim(Span::from_base_size(base, size))
			.expect("unable to claim the boot heap region");
	}
}

/// Hosted builds use the system allocator; there is nothing to claim.
#[cfg(not(target_os = "none"))]
pub(crate) unsafe fn claim_heap_region(_base: *mut u8, _size: usize) {}

/// Number of processors that finished their early bring-up.
static CPU_ONLINE: AtomicU32 = AtomicU32::new(0);

pub(crate) fn processor_count() -> u32 {
	CPU_ONLINE.load(Ordering::Acquire)
}

#[cfg(feature = "smp")]
fn synch_all_cores() {
	static CORE_COUNTER: AtomicU32 = AtomicU32::new(0);

	CORE_COUNTER.fetch_add(1, Ordering::SeqCst);

	while CORE_COUNTER.load(Ordering::SeqCst) != env::processor_count() as u32 {
		core::hint::spin_loop();
	}
}

/// Entry point for the bootstrap processor.
///
/// The boot shim converts whatever the bootloader handed over into a
/// [`LoaderBlock`] and jumps here with a valid stack and the kernel mapped
/// high.
pub fn boot_processor_main(loader_block: &'static LoaderBlock) -> ! {
	env::set_loader_block(loader_block);
	arch::message_output_init();
	logging::init();

	info!("Welcome to Boron {}", env!("CARGO_PKG_VERSION"));
	info!(
		"Booted by {} {}",
		loader_block.loader_info.name, loader_block.loader_info.version
	);

	arch::boot_processor_init();
	mm::init();
	ob::init();
	ke::add_current_core();
	CPU_ONLINE.fetch_add(1, Ordering::Release);

	#[cfg(feature = "smp")]
	{
		arch::boot_application_processors();
		synch_all_cores();
	}

	mm::switch_kernel_space_lock();
	mm::mpw::init();
	io::init();

	#[cfg(feature = "ktests")]
	ke::tests::spawn_all();

	ke::sched::idle_loop()
}

/// Entry point for an application processor.
#[cfg(feature = "smp")]
pub fn application_processor_main() -> ! {
	arch::application_processor_init();
	ke::add_current_core();
	CPU_ONLINE.fetch_add(1, Ordering::Release);

	info!("Processor {} entering the idle loop", ke::core_id());

	synch_all_cores();
	mm::switch_kernel_space_lock();

	ke::sched::idle_loop()
}
