//! Memory descriptor lists.
//!
//! An MDL pins the physical frames behind a buffer so a driver can reach
//! it regardless of which address space is current. The paging paths use
//! single-page MDLs; the read/write plumbing captures whole user or
//! kernel buffers.

use align_address::Align;
use bitflags::bitflags;
use smallvec::SmallVec;

use crate::arch::paging;
use crate::config::{PAGE_SIZE, PAGE_SHIFT};
use crate::mm::pfn::{self, Pfn};
use crate::mm::{hhdm_addr, probe};
use crate::status::{KeStatus, Status};

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct MdlFlags: u32 {
		/// The device writes into the described memory.
		const WRITE = 1 << 0;
		/// The frames were pinned from a mapped buffer and must be
		/// released when the MDL dies.
		const PINNED = 1 << 1;
	}
}

pub struct Mdl {
	frames: SmallVec<[Pfn; 8]>,
	/// Byte offset of the buffer within the first frame.
	first_page_offset: usize,
	byte_count: usize,
	flags: MdlFlags,
}

impl Mdl {
	/// Describes exactly one frame, page-aligned. The caller keeps its
	/// reference on the frame for the MDL's lifetime.
	pub fn single_page(pfn: Pfn, flags: MdlFlags) -> Mdl {
		let mut frames = SmallVec::new();
		frames.push(pfn);
		Mdl {
			frames,
			first_page_offset: 0,
			byte_count: PAGE_SIZE,
			flags: flags & !MdlFlags::PINNED,
		}
	}

	/// Captures `size` bytes at `va` in the current address space,
	/// pinning every frame behind the range.
	///
	/// `user_mode` requests a probe of the whole range first; `for_write`
	/// additionally demands it be writable. Pages are touched so the
	/// fault handler materializes anything still missing.
	pub fn capture(va: usize, size: usize, user_mode: bool, for_write: bool) -> Status<Mdl> {
		if size == 0 {
			return Err(KeStatus::InvalidParameter);
		}

		if user_mode {
			probe::probe_address(va, size, for_write)?;
		}

		let first_page = va.align_down(PAGE_SIZE);
		let page_count = (va + size - first_page).div_ceil(PAGE_SIZE);

		let mut frames = SmallVec::new();
		for i in 0..page_count {
			let page_va = first_page + (i << PAGE_SHIFT);

			// Touch to materialize demand-paged memory.
			unsafe {
				let probe_ptr = page_va as *mut u8;
				let value = core::ptr::read_volatile(probe_ptr);
				if for_write {
					core::ptr::write_volatile(probe_ptr, value);
				}
			}

			let Some(pte_ptr) = paging::get_pte_location_check(page_va, false) else {
				release_frames(&frames);
				return Err(KeStatus::AccessViolation);
			};
			let pte = unsafe { core::ptr::read_volatile(pte_ptr) };
			if !pte.is_present() {
				release_frames(&frames);
				return Err(KeStatus::AccessViolation);
			}

			let pfn = pte.pfn();
			pfn::page_add_reference(pfn);
			frames.push(pfn);
		}

		Ok(Mdl {
			frames,
			first_page_offset: va - first_page,
			byte_count: size,
			flags: if for_write {
				MdlFlags::WRITE | MdlFlags::PINNED
			} else {
				MdlFlags::PINNED
			},
		})
	}

	pub fn byte_count(&self) -> usize {
		self.byte_count
	}

	pub fn flags(&self) -> MdlFlags {
		self.flags
	}

	pub fn frame(&self, index: usize) -> Option<Pfn> {
		self.frames.get(index).copied()
	}

	/// Runs `f` over the buffer as `(byte offset, direct-map slice)`
	/// chunks, one frame at a time.
	pub fn for_each_chunk(&self, mut f: impl FnMut(usize, &mut [u8]) -> Status) -> Status {
		let mut buffer_offset = 0usize;
		let mut page_offset = self.first_page_offset;

		for &pfn in &self.frames {
			let chunk = (PAGE_SIZE - page_offset).min(self.byte_count - buffer_offset);
			if chunk == 0 {
				break;
			}

			let slice = unsafe {
				core::slice::from_raw_parts_mut(
					(hhdm_addr(pfn.address()) + page_offset) as *mut u8,
					chunk,
				)
			};
			f(buffer_offset, slice)?;

			buffer_offset += chunk;
			page_offset = 0;
		}

		Ok(())
	}

	/// Copies from the MDL's memory into `dest`.
	pub fn read_bytes(&self, offset: usize, dest: &mut [u8]) -> Status {
		if offset + dest.len() > self.byte_count {
			return Err(KeStatus::InvalidParameter);
		}

		self.for_each_chunk(|chunk_offset, chunk| {
			let start = offset.max(chunk_offset);
			let end = (offset + dest.len()).min(chunk_offset + chunk.len());
			if start < end {
				dest[start - offset..end - offset]
					.copy_from_slice(&chunk[start - chunk_offset..end - chunk_offset]);
			}
			Ok(())
		})
	}

	/// Copies `src` into the MDL's memory.
	pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Status {
		if offset + src.len() > self.byte_count {
			return Err(KeStatus::InvalidParameter);
		}

		self.for_each_chunk(|chunk_offset, chunk| {
			let start = offset.max(chunk_offset);
			let end = (offset + src.len()).min(chunk_offset + chunk.len());
			if start < end {
				chunk[start - chunk_offset..end - chunk_offset]
					.copy_from_slice(&src[start - offset..end - offset]);
			}
			Ok(())
		})
	}
}

fn release_frames(frames: &[Pfn]) {
	for &pfn in frames {
		pfn::free_physical_page(pfn);
	}
}

impl Drop for Mdl {
	fn drop(&mut self) {
		if self.flags.contains(MdlFlags::PINNED) {
			release_frames(&self.frames);
		}
	}
}
