//! The system-service surface.
//!
//! Thin shells over the executive: resolve handles, capture user
//! pointers, call in, translate nothing — object-manager and executive
//! failures surface to the caller unchanged.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::io::fcb::DirectoryEntry;
use crate::ke::wait::{Dispatch, WaitKind, wait_for_multiple, wait_for_single};
use crate::ke::{Event, EventKind, Mutex, process};
use crate::mm::probe::AccessMode;
use crate::mm::section::Section;
use crate::mm::vad::MappedObject;
use crate::mm::{self, AllocationType, Protection};
use crate::ob::{self, Handle, Object, ObjectBody};
use crate::status::{KeStatus, Status};

/// Mode the running system service was entered from.
///
/// The user-mode trap stub flips this to `User` around a service call;
/// kernel-internal callers stay `Kernel` and skip pointer capture.
pub(crate) fn previous_mode() -> AccessMode {
	AccessMode::Kernel
}

fn insert_handle(object: Arc<Object>) -> Handle {
	process::attached_process().handle_table.insert(object)
}

// Object creation and lifetime.

pub fn os_create_event(kind: EventKind, initially_signaled: bool) -> Status<Handle> {
	let object = ob::create_object(
		ObjectBody::Event(Arc::new(Event::new(kind, initially_signaled))),
		ob::event_type(),
		None,
		None,
	)?;
	Ok(insert_handle(object))
}

pub fn os_create_mutex() -> Status<Handle> {
	let object = ob::create_object(
		ObjectBody::Mutex(Arc::new(Mutex::new())),
		ob::mutex_type(),
		None,
		None,
	)?;
	Ok(insert_handle(object))
}

pub fn os_create_section(max_size: u64) -> Status<Handle> {
	let object = ob::create_object(
		ObjectBody::Section(Section::create(max_size)),
		ob::section_type(),
		None,
		None,
	)?;
	Ok(insert_handle(object))
}

/// Opens a named object from the namespace.
pub fn os_open_object_by_name(path: &str) -> Status<Handle> {
	let object = ob::open_object_by_name(path, None)?;
	Ok(insert_handle(object))
}

pub fn os_close(handle: Handle) -> Status {
	ob::close(handle)
}

// Waits.

fn dispatch_of(object: &Arc<Object>) -> Status<&dyn Dispatch> {
	object.body_dispatch().ok_or(KeStatus::InvalidParameter)
}

pub fn os_wait_for_single_object(
	handle: Handle,
	alertable: bool,
	timeout_ms: Option<u64>,
) -> Status {
	let object = ob::reference_by_handle(handle, None)?;
	wait_for_single(dispatch_of(&object)?, alertable, timeout_ms)
}

pub fn os_wait_for_multiple_objects(
	handles: &[Handle],
	wait_kind: WaitKind,
	alertable: bool,
	timeout_ms: Option<u64>,
) -> Status<usize> {
	if handles.is_empty() || handles.len() > crate::config::MAXIMUM_WAIT_BLOCKS {
		return Err(KeStatus::InvalidParameter);
	}

	let mut objects: Vec<Arc<Object>> = Vec::with_capacity(handles.len());
	for &handle in handles {
		objects.push(ob::reference_by_handle(handle, None)?);
	}

	let mut dispatches: Vec<&dyn Dispatch> = Vec::with_capacity(objects.len());
	for object in &objects {
		dispatches.push(dispatch_of(object)?);
	}

	// The same object twice would corrupt the wait bookkeeping.
	for (i, a) in dispatches.iter().enumerate() {
		for b in dispatches.iter().skip(i + 1) {
			if core::ptr::eq(a.header(), b.header()) {
				return Err(KeStatus::InvalidParameter);
			}
		}
	}

	wait_for_multiple(&dispatches, wait_kind, alertable, timeout_ms)
}

// Event and mutex services.

fn event_of(handle: Handle) -> Status<Arc<Event>> {
	let object = ob::reference_by_handle(handle, None)?;
	match &object.body {
		ObjectBody::Event(event) => Ok(event.clone()),
		_ => Err(KeStatus::TypeMismatch),
	}
}

pub fn os_set_event(handle: Handle) -> Status {
	event_of(handle)?.set(1);
	Ok(())
}

pub fn os_reset_event(handle: Handle) -> Status {
	event_of(handle)?.reset();
	Ok(())
}

pub fn os_pulse_event(handle: Handle) -> Status {
	event_of(handle)?.pulse(1);
	Ok(())
}

pub fn os_query_event(handle: Handle) -> Status<bool> {
	Ok(event_of(handle)?.read_state())
}

pub fn os_release_mutex(handle: Handle) -> Status {
	let object = ob::reference_by_handle(handle, None)?;
	match &object.body {
		ObjectBody::Mutex(mutex) => {
			mutex.release();
			Ok(())
		}
		_ => Err(KeStatus::TypeMismatch),
	}
}

pub fn os_query_mutex(handle: Handle) -> Status<i32> {
	let object = ob::reference_by_handle(handle, None)?;
	match &object.body {
		ObjectBody::Mutex(mutex) => Ok(mutex.read_state()),
		_ => Err(KeStatus::TypeMismatch),
	}
}

// Virtual memory services.

/// Reserves (and optionally commits) `size` bytes of address space.
pub fn os_allocate_virtual_memory(
	size: usize,
	allocation_type: AllocationType,
	protection: Protection,
) -> Status<usize> {
	let process = process::attached_process();
	let size_pages = size.div_ceil(crate::config::PAGE_SIZE);
	mm::services::reserve_virtual_memory(&process, size_pages, allocation_type, protection)
}

pub fn os_free_virtual_memory(va: usize) -> Status {
	let process = process::attached_process();
	mm::services::release_virtual_memory(&process, va)
}

/// Maps a view of a section or file object into the calling process.
pub fn os_map_view_of_object(
	handle: Handle,
	size: usize,
	allocation_type: AllocationType,
	section_offset: u64,
	protection: Protection,
) -> Status<usize> {
	let object = ob::reference_by_handle(handle, None)?;
	let mapped = match &object.body {
		ObjectBody::Section(section) => MappedObject::Section(section.clone()),
		ObjectBody::File(file) => MappedObject::File(file.clone()),
		_ => return Err(KeStatus::TypeMismatch),
	};

	let process = process::attached_process();
	let size_pages = size.div_ceil(crate::config::PAGE_SIZE);
	mm::view::map_view_of_object(
		&process,
		mapped,
		size_pages,
		allocation_type,
		section_offset,
		protection,
	)
}

// File services.

fn file_of(handle: Handle) -> Status<Arc<crate::io::file::FileObject>> {
	let object = ob::reference_by_handle(handle, None)?;
	match &object.body {
		ObjectBody::File(file) => Ok(file.clone()),
		_ => Err(KeStatus::TypeMismatch),
	}
}

/// Reads from a file; `offset` of `None` uses and advances the file
/// object's cursor.
pub fn os_read_file(
	handle: Handle,
	buffer: usize,
	size: usize,
	offset: Option<u64>,
) -> Status<usize> {
	let file = file_of(handle)?;
	let mode = previous_mode();

	let iosb = match offset {
		Some(offset) => crate::io::rdwr::read_file(&file, buffer, size, offset, mode)?,
		None => crate::io::rdwr::read_file_at_cursor(&file, buffer, size, mode)?,
	};
	Ok(iosb.bytes_transferred)
}

/// Writes to a file; `offset` of `None` uses and advances the cursor.
pub fn os_write_file(
	handle: Handle,
	buffer: usize,
	size: usize,
	offset: Option<u64>,
) -> Status<usize> {
	let file = file_of(handle)?;
	let mode = previous_mode();

	let iosb = match offset {
		Some(offset) => crate::io::rdwr::write_file(&file, buffer, size, offset, mode)?,
		None => crate::io::rdwr::write_file_at_cursor(&file, buffer, size, mode)?,
	};
	Ok(iosb.bytes_transferred)
}

pub fn os_get_length_file(handle: Handle) -> Status<u64> {
	Ok(file_of(handle)?.fcb.file_length())
}

pub fn os_get_alignment_file(handle: Handle) -> Status<usize> {
	let file = file_of(handle)?;
	Ok(file.fcb.dispatch.get_alignment_info(&file.fcb))
}

pub fn os_touch_file(handle: Handle, is_write: bool) -> Status {
	let file = file_of(handle)?;
	file.fcb.dispatch.touch(&file.fcb, is_write)
}

/// Reads the next directory entry through the handle's cursor.
pub fn os_read_directory_entries(handle: Handle) -> Status<DirectoryEntry> {
	let file = file_of(handle)?;
	crate::io::rdwr::read_directory_entry(&file)
}
