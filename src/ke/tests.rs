//! In-kernel executive tests, spawned at the end of bring-up on
//! development images.
//!
//! Each scenario runs in its own system thread and crashes the system on
//! divergence, so a green boot log is the pass criterion.

use alloc::sync::Arc;

use crate::ke::thread::Thread;
use crate::ke::wait::wait_for_single;
use crate::ke::{Event, EventKind, Mutex, process, sched};
use crate::mm::{self, AllocationType, Protection, pfn};
use crate::status::KeStatus;

static PRODUCED: Event = Event::new(EventKind::Synchronization, false);
static CONSUMED: Event = Event::new(EventKind::Notification, false);

extern "C" fn event_consumer(_context: usize) {
	wait_for_single(&PRODUCED, false, None).expect("consumer wait failed");
	assert!(
		!PRODUCED.read_state(),
		"a satisfied synchronization wait must consume the signal"
	);
	CONSUMED.set(0);
}

extern "C" fn event_producer(_context: usize) {
	let consumer = Thread::create(process::system_process(), event_consumer, 0)
		.expect("unable to create the consumer");
	consumer.ready();

	sched::yield_current();
	PRODUCED.set(1);

	wait_for_single(&CONSUMED, false, Some(5_000)).expect("producer wait failed");

	// A second wait must block: the signal was consumed.
	assert_eq!(
		wait_for_single(&PRODUCED, false, Some(0)),
		Err(KeStatus::Timeout)
	);

	info!("ktest: producer/consumer on a synchronization event passed");
}

static TEST_MUTEX: Mutex = Mutex::new();
static MUTEX_PHASE: Event = Event::new(EventKind::Synchronization, false);

extern "C" fn mutex_contender(_context: usize) {
	// The owner holds it twice; a poll must time out.
	assert_eq!(
		wait_for_single(&TEST_MUTEX, false, Some(0)),
		Err(KeStatus::Timeout)
	);
	MUTEX_PHASE.set(1);

	wait_for_single(&TEST_MUTEX, false, Some(5_000)).expect("mutex never became free");
	TEST_MUTEX.release();

	info!("ktest: recursive mutex passed");
}

extern "C" fn mutex_owner(_context: usize) {
	wait_for_single(&TEST_MUTEX, false, None).unwrap();
	wait_for_single(&TEST_MUTEX, false, None).unwrap();

	let contender = Thread::create(process::system_process(), mutex_contender, 0)
		.expect("unable to create the contender");
	contender.ready();

	wait_for_single(&MUTEX_PHASE, false, Some(5_000)).unwrap();

	TEST_MUTEX.release();
	TEST_MUTEX.release();
}

extern "C" fn demand_paging(_context: usize) {
	const PAGES: usize = 400;

	let process = process::attached_process();
	let before = pfn::total_free_pages();

	let va = mm::services::reserve_virtual_memory(
		&process,
		PAGES,
		AllocationType::RESERVE | AllocationType::COMMIT,
		Protection::READ | Protection::WRITE,
	)
	.expect("reserve failed");

	for i in 0..PAGES {
		unsafe {
			core::ptr::write_volatile((va + i * crate::config::PAGE_SIZE) as *mut u8, 1);
		}
	}

	// The other test threads allocate concurrently, so allow a little
	// slack around the exact page-table overhead.
	let resident = before.saturating_sub(pfn::total_free_pages());
	assert!(
		(PAGES..=PAGES + 16).contains(&resident),
		"{PAGES} touched pages cost {resident} frames"
	);

	mm::services::release_virtual_memory(&process, va).expect("release failed");

	let drift = before.abs_diff(pfn::total_free_pages());
	assert!(drift <= 16, "release leaked {drift} frames");

	info!("ktest: demand paging passed");
}

extern "C" fn pipe_backpressure(_context: usize) {
	extern "C" fn reader(context: usize) {
		let file = unsafe { Arc::from_raw(context as *const crate::io::file::FileObject) };
		let mut collected = [0u8; 32];
		let mut read = 0usize;

		while read < collected.len() {
			// Drain slowly so the writer actually blocks.
			sched::yield_current();
			let n = crate::io::rdwr::read_file(
				&file,
				collected[read..].as_mut_ptr() as usize,
				8.min(collected.len() - read),
				0,
				crate::mm::probe::AccessMode::Kernel,
			)
			.expect("pipe read failed")
			.bytes_transferred;
			read += n;
		}

		for (i, &byte) in collected.iter().enumerate() {
			assert_eq!(byte, i as u8, "pipe bytes arrived out of order");
		}

		info!("ktest: pipe backpressure passed");
	}

	let (read_end, write_end) = crate::io::pipe::create_pipe(16).expect("pipe creation failed");

	let reader_thread = Thread::create(
		process::system_process(),
		reader,
		Arc::into_raw(read_end) as usize,
	)
	.expect("unable to create the pipe reader");
	reader_thread.ready();

	let payload: alloc::vec::Vec<u8> = (0u8..32).collect();
	let written = crate::io::rdwr::write_file(
		&write_end,
		payload.as_ptr() as usize,
		payload.len(),
		0,
		crate::mm::probe::AccessMode::Kernel,
	)
	.expect("pipe write failed")
	.bytes_transferred;
	assert_eq!(written, 32);
}

extern "C" fn rwlock_handoff(_context: usize) {
	use crate::ex::RwLock;

	static LOCK: RwLock = RwLock::new();

	LOCK.acquire_shared(false, false, false).unwrap();
	assert_eq!(LOCK.acquire_exclusive(true, false), Err(KeStatus::Timeout));
	LOCK.release();

	LOCK.acquire_exclusive(false, false).unwrap();
	LOCK.demote_to_shared();
	LOCK.acquire_shared(false, false, false).unwrap();
	LOCK.release();
	LOCK.release();
	assert!(!LOCK.is_held());

	info!("ktest: rwlock handoff passed");
}

/// Spawns every scenario.
pub fn spawn_all() {
	info!("Spawning the executive test threads");

	for routine in [
		event_producer as extern "C" fn(usize),
		mutex_owner,
		demand_paging,
		pipe_backpressure,
		rwlock_handoff,
	] {
		let thread = Thread::create(process::system_process(), routine, 0)
			.expect("unable to create a test thread");
		thread.ready();
	}
}
