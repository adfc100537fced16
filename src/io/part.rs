//! Partition objects.
//!
//! A partition is a window into a containing device's FCB: reads and
//! writes are shifted by the partition base and capped to the partition
//! extent before they reach the underlying driver.

use alloc::sync::Arc;

use crate::mm::mdl::Mdl;
use crate::status::{KeStatus, Status};

use super::fcb::{Fcb, FcbDispatch, FileType, RwFlags};

pub(crate) struct PartitionExtension {
	pub parent: Arc<Fcb>,
	/// Byte offset of this partition inside the parent device.
	pub base_offset: u64,
	/// Byte length of the partition.
	pub length: u64,
}

struct PartitionDispatch;

static PARTITION_DISPATCH: PartitionDispatch = PartitionDispatch;

impl PartitionExtension {
	/// Translates a partition-relative transfer into a parent-relative
	/// one, capping it to the partition extent.
	fn clamp(&self, offset: u64, requested: usize) -> Status<(u64, usize)> {
		if offset >= self.length {
			return Err(KeStatus::OutOfFileBounds);
		}

		let available = (self.length - offset) as usize;
		Ok((self.base_offset + offset, requested.min(available)))
	}
}

impl FcbDispatch for PartitionDispatch {
	fn read(&self, fcb: &Fcb, offset: u64, mdl: &Mdl, flags: RwFlags) -> Status<usize> {
		let partition = fcb
			.extension::<PartitionExtension>()
			.ok_or(KeStatus::InvalidParameter)?;

		let (parent_offset, _capped) = partition.clamp(offset, mdl.byte_count())?;
		partition
			.parent
			.dispatch
			.read(&partition.parent, parent_offset, mdl, flags)
	}

	fn write(&self, fcb: &Fcb, offset: u64, mdl: &Mdl, flags: RwFlags) -> Status<usize> {
		let partition = fcb
			.extension::<PartitionExtension>()
			.ok_or(KeStatus::InvalidParameter)?;

		let (parent_offset, capped) = partition.clamp(offset, mdl.byte_count())?;
		if capped < mdl.byte_count() {
			// Unlike reads, a write crossing the end of the partition is
			// refused outright rather than silently truncated.
			return Err(KeStatus::OutOfFileBounds);
		}

		partition
			.parent
			.dispatch
			.write(&partition.parent, parent_offset, mdl, flags)
	}

	fn get_alignment_info(&self, fcb: &Fcb) -> usize {
		fcb.extension::<PartitionExtension>()
			.map(|partition| {
				partition
					.parent
					.dispatch
					.get_alignment_info(&partition.parent)
			})
			.unwrap_or(1)
	}

	fn seekable(&self) -> bool {
		true
	}
}

/// Creates a partition FCB spanning `base_offset..base_offset + length`
/// of `parent`.
pub fn create_partition(parent: Arc<Fcb>, base_offset: u64, length: u64) -> Status<Arc<Fcb>> {
	if length == 0 {
		return Err(KeStatus::InvalidParameter);
	}
	let end = base_offset
		.checked_add(length)
		.ok_or(KeStatus::InvalidParameter)?;
	if parent.is_seekable() && end > parent.file_length() {
		return Err(KeStatus::OutOfFileBounds);
	}

	Ok(Fcb::new(
		&PARTITION_DISPATCH,
		FileType::Partition,
		length,
		Some(alloc::boxed::Box::new(PartitionExtension {
			parent,
			base_offset,
			length,
		})),
	))
}
