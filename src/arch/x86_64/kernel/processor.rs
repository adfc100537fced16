use core::arch::asm;

use raw_cpuid::CpuId;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
use x86_64::registers::model_specific::Msr;

/// Writes the task-priority register.
///
/// The local interrupt controller refuses to deliver vectors whose priority
/// class is at or below this value, which is exactly the hardware half of
/// the IPL discipline: the vector's upper four bits are its IPL bucket.
#[inline]
pub(crate) fn set_task_priority(ipl: u8) {
	unsafe {
		asm!("mov cr8, {}", in(reg) ipl as u64, options(nomem, nostack, preserves_flags));
	}
}

#[inline]
pub(crate) fn halt() {
	x86_64::instructions::hlt();
}

/// Waits for the next interrupt with interrupts atomically enabled.
#[inline]
pub(crate) fn enable_interrupts_and_halt() {
	x86_64::instructions::interrupts::enable_and_hlt();
}

#[inline]
pub(crate) fn pause() {
	core::hint::spin_loop();
}

/// Reads the time-stamp counter; the fallback tick source before a HAL
/// timer is registered.
#[inline]
pub(crate) fn read_timestamp_counter() -> u64 {
	unsafe { core::arch::x86_64::_rdtsc() }
}

/// A 512-byte FXSAVE area holding one thread's FP and SIMD state.
#[repr(C, align(64))]
pub struct FpuState {
	region: [u8; 512],
}

impl FpuState {
	pub fn new() -> Self {
		let mut region = [0u8; 512];
		// FCW and MXCSR power-on defaults; everything else starts zero.
		region[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
		region[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
		Self { region }
	}

	pub unsafe fn save(&mut self) {
		unsafe {
			core::arch::x86_64::_fxsave64(self.region.as_mut_ptr());
		}
	}

	pub unsafe fn restore(&self) {
		unsafe {
			core::arch::x86_64::_fxrstor64(self.region.as_ptr());
		}
	}
}

/// Arms the lazy FP-state trap: the next FP instruction raises the
/// device-not-available exception, where the state actually swaps.
pub(crate) fn set_task_switched() {
	unsafe {
		let mut cr0 = Cr0::read();
		cr0.insert(Cr0Flags::TASK_SWITCHED);
		Cr0::write(cr0);
	}
}

pub(crate) fn clear_task_switched() {
	unsafe {
		asm!("clts", options(nomem, nostack));
	}
}

/// Minimal feature bring-up: write protection, global pages, no-execute.
pub(crate) fn configure() {
	let cpuid = CpuId::new();

	unsafe {
		let mut cr0 = Cr0::read();
		cr0.insert(Cr0Flags::WRITE_PROTECT);
		Cr0::write(cr0);

		let mut cr4 = Cr4::read();
		cr4.insert(Cr4Flags::PAGE_GLOBAL);
		Cr4::write(cr4);

		if let Some(info) = cpuid.get_extended_processor_and_feature_identifiers() {
			if info.has_execute_disable() {
				// EFER.NXE
				const IA32_EFER: u32 = 0xC000_0080;
				let mut efer = Msr::new(IA32_EFER);
				efer.write(efer.read() | (1 << 11));
			}
		}
	}

	if let Some(info) = cpuid.get_feature_info() {
		debug!(
			"Processor family {} model {} stepping {}",
			info.family_id(),
			info.model_id(),
			info.stepping_id()
		);
	}
}
