//! The process dispatcher object.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::OnceCell;

use crate::arch::paging::{self, PageMapping};
use crate::config::{USER_SPACE_BASE, USER_SPACE_END};
use crate::ex::RwLock;
use crate::ke::thread::{Affinity, Thread};
use crate::ke::wait::{Dispatch, DispatchHeader, DispatcherGuard, ObjectKind, wait_test};
use crate::mm::heap::AddressHeap;
use crate::mm::vad::VadList;
use crate::ob::HandleTable;
use crate::status::Status;

pub type ProcessId = u64;

/// The process object: an address space plus the threads running in it.
///
/// Signaled when the last thread exits.
pub struct Process {
	header: DispatchHeader,
	pub id: ProcessId,

	/// Root table of this process's address space.
	page_mapping: Cell<PageMapping>,
	/// Address descriptors of the user half.
	pub vad_list: VadList,
	/// Free user address ranges.
	pub heap: AddressHeap,
	/// Serializes structural changes to the user half of the address
	/// space against the fault path.
	pub address_lock: RwLock,

	default_priority: Cell<u8>,
	default_affinity: Cell<Affinity>,

	/// Threads that have not yet exited.
	live_threads: Cell<u32>,
	threads: RefCell<Vec<Weak<Thread>>>,

	pub handle_table: HandleTable,
}

// Guarded by the dispatcher lock (scheduling state) and the address-space
// lock (memory state).
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

static SYSTEM_PROCESS: OnceCell<Arc<Process>> = OnceCell::new();

impl Process {
	fn new_with_mapping(
		page_mapping: PageMapping,
		default_priority: u8,
		default_affinity: Affinity,
	) -> Arc<Process> {
		Arc::new(Process {
			header: DispatchHeader::new(ObjectKind::Process, 0),
			id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
			page_mapping: Cell::new(page_mapping),
			vad_list: VadList::new(),
			heap: AddressHeap::new(),
			address_lock: RwLock::new(),
			default_priority: Cell::new(default_priority),
			default_affinity: Cell::new(default_affinity),
			live_threads: Cell::new(0),
			threads: RefCell::new(Vec::new()),
			handle_table: HandleTable::new(),
		})
	}

	/// Creates an empty process with a fresh address space.
	pub fn create(default_priority: u8, default_affinity: Affinity) -> Status<Arc<Process>> {
		let page_mapping = paging::create_page_mapping()?;
		let process = Self::new_with_mapping(page_mapping, default_priority, default_affinity);
		process
			.heap
			.create_region(USER_SPACE_BASE, (USER_SPACE_END - USER_SPACE_BASE) >> crate::config::PAGE_SHIFT)?;
		Ok(process)
	}

	pub fn page_mapping(&self) -> PageMapping {
		self.page_mapping.get()
	}

	pub fn default_priority(&self) -> u8 {
		self.default_priority.get()
	}

	pub fn default_affinity(&self) -> Affinity {
		self.default_affinity.get()
	}

	/// Number of threads that have not exited yet.
	pub fn live_thread_count(&self) -> u32 {
		self.live_threads.get()
	}

	/// Whether the process has ever had a thread; the clone path refuses
	/// destinations that are already running.
	pub fn has_threads(&self) -> bool {
		!self.threads.borrow().is_empty()
	}

	pub(crate) fn attach_thread(&self, thread: &Arc<Thread>) {
		self.threads.borrow_mut().push(Arc::downgrade(thread));
		self.live_threads.set(self.live_threads.get() + 1);
	}

	/// Retires an exiting thread; the last one signals the process.
	pub(crate) fn retire_thread(&self, thread: &Arc<Thread>, guard: &DispatcherGuard) {
		self.threads
			.borrow_mut()
			.retain(|weak| !core::ptr::eq(weak.as_ptr(), Arc::as_ptr(thread)));

		let remaining = self.live_threads.get() - 1;
		self.live_threads.set(remaining);

		if remaining == 0 {
			self.header.set_signaled(1, guard);
			wait_test(self, 0, guard);
		}
	}

	/// Loads this process's root table on the executing CPU.
	pub(crate) unsafe fn switch_to_address_space(&self) {
		unsafe {
			paging::switch_page_mapping(self.page_mapping());
		}
	}
}

impl Dispatch for Process {
	fn header(&self) -> &DispatchHeader {
		&self.header
	}
}

/// The process that owns all kernel-only threads and the kernel half of
/// every address space.
pub fn system_process() -> &'static Arc<Process> {
	SYSTEM_PROCESS
		.get()
		.expect("the system process has not been initialized yet")
}

pub(crate) fn init_system_process() {
	let process = Process::new_with_mapping(paging::current_page_mapping(), 8, Affinity::MAX);
	process
		.heap
		.create_region(
			USER_SPACE_BASE,
			(USER_SPACE_END - USER_SPACE_BASE) >> crate::config::PAGE_SHIFT,
		)
		.expect("the system process heap must start empty");
	SYSTEM_PROCESS
		.set(process)
		.ok()
		.expect("the system process must only be initialized once");
}

/// The process whose address space the current thread uses.
pub fn attached_process() -> Arc<Process> {
	crate::ke::current_thread().effective_process()
}
