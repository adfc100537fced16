//! Anonymous pipes.
//!
//! A pipe is a bounded byte ring behind a pair of file objects. Readers
//! block while the ring is empty, writers block while it is full; both
//! sides make forward progress in chunks, so a writer larger than the
//! ring drains through it as the reader consumes.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::RefCell;

use crate::ke::{Event, EventKind, Mutex};
use crate::mm::mdl::Mdl;
use crate::status::{KeStatus, Status};

use super::fcb::{DispatchFlags, Fcb, FcbDispatch, FileType, RwFlags};
use super::file::{FileFlags, FileObject};

pub(crate) struct PipeExtension {
	ring: RefCell<VecDeque<u8>>,
	capacity: usize,
	mutex: Mutex,
	/// Signaled whenever bytes arrive.
	data_available: Event,
	/// Signaled whenever space frees up.
	space_available: Event,
}

// The ring is guarded by the mutex.
unsafe impl Send for PipeExtension {}
unsafe impl Sync for PipeExtension {}

struct PipeDispatch;

static PIPE_DISPATCH: PipeDispatch = PipeDispatch;

impl FcbDispatch for PipeDispatch {
	fn flags(&self) -> DispatchFlags {
		DispatchFlags::empty()
	}

	fn seekable(&self) -> bool {
		false
	}

	fn read(&self, fcb: &Fcb, _offset: u64, mdl: &Mdl, _flags: RwFlags) -> Status<usize> {
		let pipe = fcb
			.extension::<PipeExtension>()
			.ok_or(KeStatus::InvalidParameter)?;

		loop {
			{
				let _guard = pipe.mutex.guard();
				let mut ring = pipe.ring.borrow_mut();

				if !ring.is_empty() {
					let count = ring.len().min(mdl.byte_count());
					let mut scratch = alloc::vec![0u8; count];
					for byte in scratch.iter_mut() {
						*byte = ring.pop_front().unwrap();
					}
					mdl.write_bytes(0, &scratch)?;

					pipe.space_available.set(1);
					return Ok(count);
				}
			}

			crate::ke::wait::wait_for_single(&pipe.data_available, false, None)?;
		}
	}

	fn write(&self, fcb: &Fcb, _offset: u64, mdl: &Mdl, _flags: RwFlags) -> Status<usize> {
		let pipe = fcb
			.extension::<PipeExtension>()
			.ok_or(KeStatus::InvalidParameter)?;

		let total = mdl.byte_count();
		let mut written = 0usize;

		while written < total {
			let chunk = {
				let _guard = pipe.mutex.guard();
				let mut ring = pipe.ring.borrow_mut();

				let free = pipe.capacity - ring.len();
				let chunk = free.min(total - written);
				if chunk > 0 {
					let mut scratch = alloc::vec![0u8; chunk];
					mdl.read_bytes(written, &mut scratch)?;
					ring.extend(scratch.iter().copied());

					pipe.data_available.set(1);
				}
				chunk
			};

			written += chunk;
			if written < total {
				// Ring full: wait for the reader.
				crate::ke::wait::wait_for_single(&pipe.space_available, false, None)?;
			}
		}

		Ok(written)
	}
}

/// Creates a pipe of `capacity` bytes, returning its read and write ends.
pub fn create_pipe(capacity: usize) -> Status<(Arc<FileObject>, Arc<FileObject>)> {
	if capacity == 0 {
		return Err(KeStatus::InvalidParameter);
	}

	let extension = PipeExtension {
		ring: RefCell::new(VecDeque::with_capacity(capacity)),
		capacity,
		mutex: Mutex::new(),
		data_available: Event::new(EventKind::Synchronization, false),
		space_available: Event::new(EventKind::Synchronization, false),
	};

	let fcb = Fcb::new(
		&PIPE_DISPATCH,
		FileType::Pipe,
		0,
		Some(alloc::boxed::Box::new(extension)),
	);

	let read_end = FileObject::create(fcb.clone(), FileFlags::empty(), 0);
	let write_end = FileObject::create(fcb, FileFlags::empty(), 0);
	Ok((read_end, write_end))
}

#[cfg(not(target_os = "none"))]
#[test]
fn ring_math_respects_capacity() {
	// The blocking paths need live threads; the bounded-ring arithmetic
	// does not.
	let mut ring: VecDeque<u8> = VecDeque::with_capacity(16);
	let capacity = 16usize;

	let payload: alloc::vec::Vec<u8> = (0u8..32).collect();
	let mut written = 0usize;
	let mut read_back = alloc::vec::Vec::new();

	while written < payload.len() {
		let free = capacity - ring.len();
		let chunk = free.min(payload.len() - written);
		ring.extend(payload[written..written + chunk].iter().copied());
		written += chunk;

		// A reader draining half the ring lets the writer continue.
		for _ in 0..ring.len().min(8) {
			read_back.push(ring.pop_front().unwrap());
		}
	}
	while let Some(byte) = ring.pop_front() {
		read_back.push(byte);
	}

	assert_eq!(read_back, payload);
}
