//! The read/write plumbing between file objects and drivers.
//!
//! Transfers take the FCB lock — shared unless the driver demands
//! exclusive dispatch or the write must honor append-only — clamp against
//! the end of the file, and go to the driver as an MDL.

use crate::mm::mdl::Mdl;
use crate::mm::pfn::Pfn;
use crate::mm::probe::AccessMode;
use crate::status::{KeStatus, Status};

use super::fcb::{DispatchFlags, Fcb, RwFlags};
use super::file::FileObject;

/// Result of one transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoStatusBlock {
	pub bytes_transferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoOperation {
	Read,
	Write,
}

fn lock_for_operation(fcb: &Fcb, operation: IoOperation, append: bool) -> RwFlags {
	let exclusive = fcb.dispatch.flags().contains(DispatchFlags::EXCLUSIVE)
		|| (operation == IoOperation::Write && append);

	if exclusive {
		fcb.rwlock
			.acquire_exclusive(false, false)
			.expect("non-alertable lock acquisition cannot fail");
		RwFlags::LOCKED_EXCLUSIVE
	} else {
		fcb.rwlock
			.acquire_shared(false, false, false)
			.expect("non-alertable lock acquisition cannot fail");
		RwFlags::empty()
	}
}

/// Clamps `offset..offset + requested` against the file length.
///
/// An offset at or past the end reads zero bytes ([`KeStatus::EndOfFile`]);
/// writes past the end of a fixed-extent file fail with
/// [`KeStatus::OutOfFileBounds`].
fn clamp_transfer(
	fcb: &Fcb,
	offset: u64,
	requested: usize,
	operation: IoOperation,
) -> Status<usize> {
	if !fcb.is_seekable() {
		return Ok(requested);
	}

	let length = fcb.file_length();
	match operation {
		IoOperation::Read => {
			if offset >= length {
				return Err(KeStatus::EndOfFile);
			}
			Ok(requested.min((length - offset) as usize))
		}
		IoOperation::Write => {
			if offset > length {
				return Err(KeStatus::OutOfFileBounds);
			}
			Ok(requested)
		}
	}
}

fn perform_locked(
	file: &FileObject,
	operation: IoOperation,
	mdl: &Mdl,
	offset: u64,
	mut flags: RwFlags,
) -> Status<IoStatusBlock> {
	let fcb = &file.fcb;

	let append = file.flags.contains(super::file::FileFlags::APPEND_ONLY);
	flags |= lock_for_operation(fcb, operation, append);

	let result = (|| {
		let offset = if append && operation == IoOperation::Write {
			fcb.file_length()
		} else {
			offset
		};

		clamp_transfer(fcb, offset, mdl.byte_count(), operation)?;

		let bytes = match operation {
			IoOperation::Read => fcb.dispatch.read(fcb, offset, mdl, flags)?,
			IoOperation::Write => fcb.dispatch.write(fcb, offset, mdl, flags)?,
		};

		Ok(IoStatusBlock {
			bytes_transferred: bytes,
		})
	})();

	fcb.rwlock.release();

	if result.is_ok() {
		// Touch failures are deliberately dropped; metadata freshness is
		// not worth failing a completed transfer over.
		let _ = fcb.dispatch.touch(fcb, operation == IoOperation::Write);
	}

	result
}

/// Reads `size` bytes at `offset` into `buffer`.
pub fn read_file(
	file: &FileObject,
	buffer: usize,
	size: usize,
	offset: u64,
	mode: AccessMode,
) -> Status<IoStatusBlock> {
	let mdl = Mdl::capture(buffer, size, mode == AccessMode::User, true)?;
	perform_locked(file, IoOperation::Read, &mdl, offset, RwFlags::empty())
}

/// Writes `size` bytes at `offset` from `buffer`.
pub fn write_file(
	file: &FileObject,
	buffer: usize,
	size: usize,
	offset: u64,
	mode: AccessMode,
) -> Status<IoStatusBlock> {
	let mdl = Mdl::capture(buffer, size, mode == AccessMode::User, false)?;
	perform_locked(file, IoOperation::Write, &mdl, offset, RwFlags::empty())
}

/// Reads through the file object's implicit offset, advancing it.
pub fn read_file_at_cursor(
	file: &FileObject,
	buffer: usize,
	size: usize,
	mode: AccessMode,
) -> Status<IoStatusBlock> {
	let mdl = Mdl::capture(buffer, size, mode == AccessMode::User, true)?;
	file.with_offset(|offset| {
		match perform_locked(file, IoOperation::Read, &mdl, offset, RwFlags::empty()) {
			Ok(iosb) => (offset + iosb.bytes_transferred as u64, Ok(iosb)),
			Err(err) => (offset, Err(err)),
		}
	})
}

/// Writes through the file object's implicit offset, advancing it.
pub fn write_file_at_cursor(
	file: &FileObject,
	buffer: usize,
	size: usize,
	mode: AccessMode,
) -> Status<IoStatusBlock> {
	let mdl = Mdl::capture(buffer, size, mode == AccessMode::User, false)?;
	file.with_offset(|offset| {
		match perform_locked(file, IoOperation::Write, &mdl, offset, RwFlags::empty()) {
			Ok(iosb) => (offset + iosb.bytes_transferred as u64, Ok(iosb)),
			Err(err) => (offset, Err(err)),
		}
	})
}

/// Fault-path read of one page into a pinned frame.
pub(crate) fn perform_paging_read(file: &FileObject, mdl: &Mdl, offset: u64) -> Status {
	perform_locked(file, IoOperation::Read, mdl, offset, RwFlags::PAGING).map(|_| ())
}

/// Modified-page-writer write of one frame back to its file.
pub(crate) fn perform_modified_page_write(fcb: &Fcb, pfn: Pfn, offset: u64) -> Status {
	let mdl = Mdl::single_page(pfn, crate::mm::mdl::MdlFlags::empty());

	fcb.rwlock
		.acquire_shared(false, false, true)
		.expect("non-alertable lock acquisition cannot fail");
	let result = fcb
		.dispatch
		.write(fcb, offset, &mdl, RwFlags::PAGING)
		.map(|_| ());
	fcb.rwlock.release();

	result
}

/// Reads the next directory entry through the file object's cursor.
pub fn read_directory_entry(file: &FileObject) -> Status<super::fcb::DirectoryEntry> {
	let fcb = &file.fcb;

	fcb.rwlock
		.acquire_shared(false, false, false)
		.expect("non-alertable lock acquisition cannot fail");

	let result = (|| {
		let (mut cursor, _version) = file.dir_cursor();
		let entry = fcb.dispatch.read_dir(fcb, &mut cursor)?;
		file.set_dir_cursor((cursor, _version));
		Ok(entry)
	})();

	fcb.rwlock.release();
	result
}
