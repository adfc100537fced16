//! User-pointer capture.
//!
//! System services never trust a user pointer: the address range is probed
//! against the user half of the address space and the data moved with
//! [`safe_copy`], which honors the previous mode of the calling thread.

use crate::config::KERNEL_SPACE_BASE;
use crate::status::{KeStatus, Status};

/// Mode a system service was entered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
	Kernel,
	User,
}

/// Checks that `va..va + size` lies entirely in user space and that every
/// page of it is backed by an address descriptor.
///
/// Probing proves the range *can* be valid, not that it stays valid; the
/// actual transfer still goes through [`safe_copy`] or an MDL capture.
pub fn probe_address(va: usize, size: usize, _for_write: bool) -> Status {
	if size == 0 {
		return Ok(());
	}

	let end = va.checked_add(size).ok_or(KeStatus::AccessViolation)?;
	if end > KERNEL_SPACE_BASE || va >= KERNEL_SPACE_BASE {
		return Err(KeStatus::AccessViolation);
	}

	let process = crate::ke::process::attached_process();
	let guard = process.vad_list.lock();

	let mut cursor = va;
	while cursor < end {
		let covered = process
			.vad_list
			.with_vad_at(cursor, &guard, |vad| vad.end_va())
			.ok_or(KeStatus::AccessViolation)?;
		cursor = covered;
	}

	Ok(())
}

/// Copies `size` bytes from `src` to `dest`, probing whichever side the
/// previous mode makes untrusted.
///
/// `dest_is_user` names the direction: writes to user memory probe the
/// destination, reads from it probe the source.
pub fn safe_copy(
	dest: usize,
	src: usize,
	size: usize,
	mode: AccessMode,
	dest_is_user: bool,
) -> Status {
	if mode == AccessMode::User {
		if dest_is_user {
			probe_address(dest, size, true)?;
		} else {
			probe_address(src, size, false)?;
		}
	}

	// The probe above plus the fault handler make this an ordinary copy;
	// a user mapping yanked between probe and copy faults and terminates
	// the offending thread rather than the kernel.
	unsafe {
		core::ptr::copy_nonoverlapping(src as *const u8, dest as *mut u8, size);
	}

	Ok(())
}
