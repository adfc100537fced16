use core::fmt;

use hermit_sync::InterruptTicketMutex;

pub(crate) struct Console(());

/// Synchronizes all text output of the kernel.
///
/// The crash path bypasses this lock deliberately; see [`crate::ke::crash`].
pub(crate) static CONSOLE: InterruptTicketMutex<Console> = InterruptTicketMutex::new(Console(()));

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		crate::arch::output_message_buf(s.as_bytes());
		Ok(())
	}
}

pub(crate) fn print(args: fmt::Arguments<'_>) {
	use fmt::Write;

	CONSOLE.lock().write_fmt(args).ok();
}
