use hermit_sync::InterruptTicketMutex;
use uart_16550::SerialPort;

const SERIAL_IO_PORT: u16 = 0x3F8;

static COM1: InterruptTicketMutex<Option<SerialPort>> = InterruptTicketMutex::new(None);

pub(crate) fn init() {
	let mut port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
	port.init();
	*COM1.lock() = Some(port);
}

pub(crate) fn write_bytes(buf: &[u8]) {
	if let Some(port) = COM1.lock().as_mut() {
		for &byte in buf {
			port.send(byte);
		}
	}
}

/// Writes directly to the UART without taking the port lock.
///
/// Only for the crash path, where the lock may be held by the interrupted
/// context and will never be released again.
pub(crate) unsafe fn write_bytes_unlocked(buf: &[u8]) {
	let mut port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
	for &byte in buf {
		port.send(byte);
	}
}
