use core::panic::PanicInfo;

/// An unwound panic does not exist in this kernel; every panic is a stop.
#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
	crate::ke::crash(format_args!("{info}"))
}
