use alloc::boxed::Box;
use alloc::vec::Vec;

use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, DS, ES, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

use crate::config::KERNEL_STACK_SIZE;
use crate::ke;

/// Interrupt stacks per CPU.
///
/// IST1 is shared by ordinary interrupts; NMI, double fault, and machine
/// check each get a dedicated known-good stack.
const IST_ENTRIES: usize = 4;

/// Builds and loads the GDT and TSS of the executing CPU.
///
/// Every CPU owns its tables; they live for the lifetime of the system.
/// The TSS pointer is published in the PRCB so that the context switch can
/// update `rsp0` for the incoming thread.
pub(crate) fn add_current_core() {
	let tss: *mut TaskStateSegment = Box::leak(Box::new(TaskStateSegment::new()));

	unsafe {
		let ist_table = core::ptr::addr_of_mut!((*tss).interrupt_stack_table) as *mut VirtAddr;
		for i in 0..IST_ENTRIES {
			let stack: Vec<u8> = vec![0; KERNEL_STACK_SIZE];
			let base = Box::leak(stack.into_boxed_slice()).as_mut_ptr();
			let value = VirtAddr::from_ptr(base) + KERNEL_STACK_SIZE as u64 - 0x10u64;
			ist_table.add(i).write_unaligned(value);
		}
	}

	let gdt = Box::leak(Box::new(GlobalDescriptorTable::new()));
	let kernel_code = gdt.append(Descriptor::kernel_code_segment());
	let kernel_data = gdt.append(Descriptor::kernel_data_segment());
	let tss_selector = gdt.append(Descriptor::tss_segment(unsafe { &*tss }));

	unsafe {
		gdt.load_unsafe();
		CS::set_reg(kernel_code);
		DS::set_reg(kernel_data);
		ES::set_reg(kernel_data);
		SS::set_reg(kernel_data);
		load_tss(tss_selector);
	}

	ke::prcb().set_tss(tss);
}

/// Points `rsp0` of this CPU's TSS at the incoming thread's kernel stack.
///
/// Called from the context-switch assembly once the new stack is active.
#[unsafe(no_mangle)]
pub(crate) extern "C" fn set_current_kernel_stack() {
	ke::sched::set_current_kernel_stack();
}
