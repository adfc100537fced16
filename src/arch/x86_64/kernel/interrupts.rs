use hermit_sync::OnceCell;
use x86_64::registers::control::Cr2;
use x86_64::set_general_handler;
use x86_64::structures::idt::{InterruptDescriptorTable, PageFaultErrorCode};

use crate::ke;
use crate::mm;
use crate::status::KeStatus;

pub use x86_64::instructions::interrupts::{are_enabled, disable, enable};
pub use x86_64::structures::idt::InterruptStackFrame as ExceptionStackFrame;

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::new();

/// Builds the interrupt descriptor table.
///
/// All 32 CPU exceptions get dedicated handlers; every other vector funnels
/// through the generic trap dispatcher, which looks up the vector's IPL and
/// registered handler at runtime. Critical exceptions run on dedicated
/// known-good stacks:
///   - Non-Maskable Interrupt (IST2)
///   - Double Fault (IST3)
///   - Machine Check (IST4)
pub(crate) fn install() {
	let mut idt = InterruptDescriptorTable::new();
	unsafe {
		idt.divide_error
			.set_handler_fn(divide_error_exception)
			.set_stack_index(0);
		idt.debug.set_handler_fn(debug_exception).set_stack_index(0);
		idt.non_maskable_interrupt
			.set_handler_fn(nmi_exception)
			.set_stack_index(1);
		idt.breakpoint
			.set_handler_fn(breakpoint_exception)
			.set_stack_index(0);
		idt.overflow
			.set_handler_fn(overflow_exception)
			.set_stack_index(0);
		idt.bound_range_exceeded
			.set_handler_fn(bound_range_exceeded_exception)
			.set_stack_index(0);
		idt.invalid_opcode
			.set_handler_fn(invalid_opcode_exception)
			.set_stack_index(0);
		idt.device_not_available
			.set_handler_fn(device_not_available_exception)
			.set_stack_index(0);
		idt.double_fault
			.set_handler_fn(double_fault_exception)
			.set_stack_index(2);
		idt.invalid_tss
			.set_handler_fn(invalid_tss_exception)
			.set_stack_index(0);
		idt.segment_not_present
			.set_handler_fn(segment_not_present_exception)
			.set_stack_index(0);
		idt.stack_segment_fault
			.set_handler_fn(stack_segment_fault_exception)
			.set_stack_index(0);
		idt.general_protection_fault
			.set_handler_fn(general_protection_exception)
			.set_stack_index(0);
		idt.page_fault
			.set_handler_fn(page_fault_handler)
			.set_stack_index(0);
		idt.machine_check
			.set_handler_fn(machine_check_exception)
			.set_stack_index(3);
	}

	set_general_handler!(&mut idt, dispatch_trap, 32..);

	if IDT.set(idt).is_err() {
		panic!("the IDT must only be installed once");
	}
}

pub(crate) fn load_idt() {
	IDT.get().expect("the IDT has not been installed yet").load();
}

/// Generic trap entry for vectors 32..256.
///
/// The register frame was saved by the compiler-generated stub; from here
/// the interrupt runs through the IPL pipeline.
fn dispatch_trap(_stack_frame: ExceptionStackFrame, index: u8, _error_code: Option<u64>) {
	ke::irq::dispatch_interrupt(index);
}

extern "x86-interrupt" fn divide_error_exception(stack_frame: ExceptionStackFrame) {
	ke::crash(format_args!(
		"Divide Error (#DE) Exception: {stack_frame:#?}"
	));
}

extern "x86-interrupt" fn debug_exception(stack_frame: ExceptionStackFrame) {
	ke::crash(format_args!("Debug (#DB) Exception: {stack_frame:#?}"));
}

extern "x86-interrupt" fn nmi_exception(stack_frame: ExceptionStackFrame) {
	// An NMI is either the crash IPI of another processor or a fatal
	// hardware condition.
	if ke::crash_in_progress() {
		ke::crash_secondary();
	}
	ke::crash(format_args!(
		"Non-Maskable Interrupt (NMI) Exception: {stack_frame:#?}"
	));
}

extern "x86-interrupt" fn breakpoint_exception(stack_frame: ExceptionStackFrame) {
	ke::crash(format_args!("Breakpoint (#BP) Exception: {stack_frame:#?}"));
}

extern "x86-interrupt" fn overflow_exception(stack_frame: ExceptionStackFrame) {
	ke::crash(format_args!("Overflow (#OF) Exception: {stack_frame:#?}"));
}

extern "x86-interrupt" fn bound_range_exceeded_exception(stack_frame: ExceptionStackFrame) {
	ke::crash(format_args!(
		"BOUND Range Exceeded (#BR) Exception: {stack_frame:#?}"
	));
}

extern "x86-interrupt" fn invalid_opcode_exception(stack_frame: ExceptionStackFrame) {
	ke::crash(format_args!(
		"Invalid Opcode (#UD) Exception: {stack_frame:#?}"
	));
}

extern "x86-interrupt" fn device_not_available_exception(_stack_frame: ExceptionStackFrame) {
	// The task-switched flag is set on every context switch; the first FP
	// instruction afterwards lands here so the FP state swaps lazily.
	crate::arch::kernel::processor::clear_task_switched();
	ke::sched::fpu_switch();
}

extern "x86-interrupt" fn double_fault_exception(
	stack_frame: ExceptionStackFrame,
	error_code: u64,
) -> ! {
	ke::crash(format_args!(
		"Double Fault (#DF) Exception: {stack_frame:#?}, error {error_code:#X}"
	));
}

extern "x86-interrupt" fn invalid_tss_exception(stack_frame: ExceptionStackFrame, _code: u64) {
	ke::crash(format_args!("Invalid TSS (#TS) Exception: {stack_frame:#?}"));
}

extern "x86-interrupt" fn segment_not_present_exception(
	stack_frame: ExceptionStackFrame,
	_code: u64,
) {
	ke::crash(format_args!(
		"Segment Not Present (#NP) Exception: {stack_frame:#?}"
	));
}

extern "x86-interrupt" fn stack_segment_fault_exception(
	stack_frame: ExceptionStackFrame,
	error_code: u64,
) {
	ke::crash(format_args!(
		"Stack Segment Fault (#SS) Exception: {stack_frame:#?}, error {error_code:#X}"
	));
}

extern "x86-interrupt" fn general_protection_exception(
	stack_frame: ExceptionStackFrame,
	error_code: u64,
) {
	ke::crash(format_args!(
		"General Protection (#GP) Exception: {stack_frame:#?}, error {error_code:#X}"
	));
}

extern "x86-interrupt" fn machine_check_exception(stack_frame: ExceptionStackFrame) -> ! {
	ke::crash(format_args!(
		"Machine Check (#MC) Exception: {stack_frame:#?}"
	));
}

pub(crate) extern "x86-interrupt" fn page_fault_handler(
	stack_frame: ExceptionStackFrame,
	error_code: PageFaultErrorCode,
) {
	let fault_address = Cr2::read()
		.map(|addr| addr.as_u64() as usize)
		.unwrap_or_default();
	let fault_pc = stack_frame.instruction_pointer.as_u64() as usize;

	let mut mode = mm::FaultMode::empty();
	if error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
		mode |= mm::FaultMode::WRITE;
	}
	if error_code.contains(PageFaultErrorCode::USER_MODE) {
		mode |= mm::FaultMode::USER;
	}

	// The gate cleared the interrupt flag; faults from interruptible
	// contexts stay interruptible while they are resolved (the handler
	// may block on paging I/O).
	if stack_frame
		.cpu_flags
		.contains(x86_64::registers::rflags::RFlags::INTERRUPT_FLAG)
	{
		enable();
	}

	// The fault entry retries on its own; only terminal failures get here.
	match mm::fault::page_fault(fault_pc, fault_address, mode) {
		Ok(()) => (),
		Err(KeStatus::AccessViolation) if mode.contains(mm::FaultMode::USER) => {
			warn!(
				"Access violation at {fault_address:#x} (pc {fault_pc:#x}); terminating thread"
			);
			ke::thread::terminate_current_for_fault();
		}
		Err(status) => {
			ke::crash(format_args!(
				"unhandled kernel page fault at {fault_address:#x} (pc {fault_pc:#x}): {status}, {stack_frame:#?}"
			));
		}
	}
}
