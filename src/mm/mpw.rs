//! The modified-page writer.
//!
//! A dedicated system thread that drains the modified list: dirty,
//! fully-unmapped cache pages get written back to their file and parked
//! on the standby list, where reclaim can take them. The writer holds an
//! explicit reference across the unlocked write so a concurrent release
//! cannot requeue the frame under it.

use hermit_sync::OnceCell;

use crate::config::PAGE_SHIFT;
use crate::io::rdwr;
use crate::ke::thread::Thread;
use crate::ke::wait::wait_for_single;
use crate::ke::{Event, EventKind, process};
use crate::mm::pfn;

static MPW_EVENT: Event = Event::new(EventKind::Synchronization, false);
static MPW_THREAD: OnceCell<alloc::sync::Arc<Thread>> = OnceCell::new();

/// Wakes the writer; anyone noticing memory pressure may call this.
pub fn signal() {
	MPW_EVENT.set(0);
}

extern "C" fn modified_page_writer(_context: usize) {
	loop {
		wait_for_single(&MPW_EVENT, false, None)
			.expect("an untimed non-alertable wait cannot fail");

		loop {
			let (pfn, fcb, offset_page) = match pfn::with_database(|db| {
				let pfn = db.take_modified_for_write()?;
				let entry = db.entry(pfn);
				Some((pfn, entry.cache_fcb, entry.cache_offset_page))
			}) {
				Some(work) => work,
				None => break,
			};

			if fcb.is_null() {
				// The file vanished between dirtying and writing; the
				// cache purge already severed the entry.
				pfn::with_database(|db| db.finish_modified_write(pfn));
				continue;
			}

			// The frame now carries the writer's reference; the database
			// lock is dropped for the duration of the I/O.
			let fcb_ref = unsafe { &*fcb };
			let status = rdwr::perform_modified_page_write(
				fcb_ref,
				pfn,
				(offset_page << PAGE_SHIFT) as u64,
			);

			pfn::with_database(|db| match status {
				Ok(()) => db.finish_modified_write(pfn),
				Err(err) => {
					warn!("unable to write frame {pfn:?} back: {err}; requeueing");
					db.requeue_modified(pfn);
				}
			});
		}
	}
}

/// Starts the writer thread. Called once the scheduler is running.
pub(crate) fn init() {
	let thread = Thread::create(process::system_process(), modified_page_writer, 0)
		.expect("unable to create the modified-page writer");
	thread.ready();
	MPW_THREAD.set(thread).ok();
}
