//! The kernel core: processor control blocks, the IPL discipline, the
//! dispatcher objects, deferred and asynchronous procedure calls, and the
//! scheduler.

pub mod apc;
pub mod dpc;
pub mod event;
pub mod ipl;
pub mod irq;
pub mod mutex;
pub mod process;
pub mod sched;
pub mod semaphore;
pub mod spinlock;
#[cfg(feature = "ktests")]
pub mod tests;
pub mod thread;
pub mod timer;
pub mod wait;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bit_field::BitField;
use hermit_sync::InterruptTicketMutex;

use crate::arch::kernel::core_local;
use crate::hal;
use crate::ke::ipl::Ipl;
use crate::ke::sched::CpuSched;
use crate::ke::thread::Thread;
use crate::ke::timer::TimerQueue;

pub use self::event::{Event, EventKind};
pub use self::mutex::Mutex;
pub use self::process::Process;
pub use self::semaphore::Semaphore;
pub use self::spinlock::{SpinLock, SpinLockGuard};
pub use self::timer::Timer;
pub use self::wait::{WaitKind, wait_for_multiple_objects, wait_for_single_object};

/// Sequential identifier of a processor.
pub type CoreId = u32;

#[repr(align(64))]
pub(crate) struct IrqStatistics {
	pub counters: [AtomicU64; 256],
}

impl IrqStatistics {
	pub const fn new() -> Self {
		Self {
			counters: [const { AtomicU64::new(0) }; 256],
		}
	}

	pub fn inc(&self, pos: u8) {
		self.counters[pos as usize].fetch_add(1, Ordering::Relaxed);
	}
}

/// Work pushed at a processor by its peers.
///
/// Remote CPUs never touch another CPU's scheduler state directly; they
/// park threads here and the owning CPU folds them into its ready queues
/// at the next DPC-level dispatch.
pub(crate) struct SchedulerInput {
	pub wakeup_threads: VecDeque<Arc<Thread>>,
}

impl SchedulerInput {
	pub const fn new() -> Self {
		Self {
			wakeup_threads: VecDeque::new(),
		}
	}
}

/// Per-CPU scratch for the TLB-shootdown handshake.
pub(crate) struct ShootdownScratch {
	pub address: AtomicU64,
	pub length: AtomicU64,
	/// Held by the initiator until this CPU acknowledges the invalidation.
	pub busy: AtomicBool,
}

/// The processor control block.
///
/// One per CPU, allocated at bring-up and never freed. The owning CPU
/// reaches it through `GS`; remote CPUs find it in the registry but may
/// only touch the explicitly cross-CPU fields ([`SchedulerInput`], the
/// shootdown scratch, the interrupt counters).
#[cfg_attr(target_arch = "x86_64", repr(align(128)))]
pub struct Prcb {
	/// Sequential id of this CPU.
	pub id: CoreId,
	/// Interrupt-controller id of this CPU.
	pub hardware_id: u32,

	/// Current IPL. Own CPU, interrupts disabled.
	ipl: Cell<Ipl>,
	/// Pending software interrupts, one bit per level. Own CPU, interrupts
	/// disabled.
	pending_soft: Cell<u16>,
	/// Hardware interrupts that arrived at or below the IPL of the moment
	/// and wait for replay. Own CPU, interrupts disabled.
	deferred_interrupts: RefCell<VecDeque<u8>>,

	/// DPC queue of this CPU. Own CPU, interrupts disabled.
	pub(crate) dpc_queue: RefCell<VecDeque<Arc<dpc::Dpc>>>,
	/// Timer queue of this CPU, sorted by expiry. Own CPU, IPL >= Dpc.
	pub(crate) timer_queue: RefCell<TimerQueue>,
	/// Scheduler state of this CPU. Own CPU, interrupts disabled.
	pub(crate) sched: RefCell<CpuSched>,
	/// Cross-CPU wakeup requests.
	pub(crate) scheduler_input: InterruptTicketMutex<SchedulerInput>,

	pub(crate) shootdown: ShootdownScratch,
	pub(crate) irq_statistics: IrqStatistics,

	/// The TSS of this CPU, for pointing `rsp0` at the running thread's
	/// kernel stack.
	#[cfg(target_arch = "x86_64")]
	tss: Cell<*mut x86_64::structures::tss::TaskStateSegment>,
}

// The fields above are either owned by the one CPU the block belongs to or
// are explicitly synchronized.
unsafe impl Sync for Prcb {}

impl Prcb {
	fn new(id: CoreId, hardware_id: u32) -> Self {
		Self {
			id,
			hardware_id,
			ipl: Cell::new(Ipl::NoInts),
			pending_soft: Cell::new(0),
			deferred_interrupts: RefCell::new(VecDeque::new()),
			dpc_queue: RefCell::new(VecDeque::new()),
			timer_queue: RefCell::new(TimerQueue::new()),
			sched: RefCell::new(CpuSched::new()),
			scheduler_input: InterruptTicketMutex::new(SchedulerInput::new()),
			shootdown: ShootdownScratch {
				address: AtomicU64::new(0),
				length: AtomicU64::new(0),
				busy: AtomicBool::new(false),
			},
			irq_statistics: IrqStatistics::new(),
			#[cfg(target_arch = "x86_64")]
			tss: Cell::new(core::ptr::null_mut()),
		}
	}

	#[inline]
	pub(crate) fn ipl(&self) -> Ipl {
		self.ipl.get()
	}

	#[inline]
	pub(crate) fn set_ipl(&self, ipl: Ipl) {
		self.ipl.set(ipl);
	}

	#[inline]
	pub(crate) fn pending_soft_interrupts(&self) -> u16 {
		self.pending_soft.get()
	}

	pub(crate) fn set_pending_soft_interrupt(&self, level: Ipl) {
		let mut pending = self.pending_soft.get();
		pending.set_bit(u8::from(level) as usize, true);
		self.pending_soft.set(pending);
	}

	pub(crate) fn clear_pending_soft_interrupt(&self, level: Ipl) {
		let mut pending = self.pending_soft.get();
		pending.set_bit(u8::from(level) as usize, false);
		self.pending_soft.set(pending);
	}

	pub(crate) fn defer_interrupt(&self, vector: u8) {
		self.deferred_interrupts.borrow_mut().push_back(vector);
	}

	/// Pops the first deferred interrupt whose IPL is above `floor`.
	pub(crate) fn pop_deferred_interrupt(&self, floor: Ipl) -> Option<u8> {
		let mut deferred = self.deferred_interrupts.borrow_mut();
		let position = deferred
			.iter()
			.position(|&vector| irq::vector_ipl(vector) > floor)?;
		deferred.remove(position)
	}

	pub(crate) fn increment_interrupt_counter(&self, vector: u8) {
		self.irq_statistics.inc(vector);
	}

	#[cfg(target_arch = "x86_64")]
	pub(crate) fn set_tss(&self, tss: *mut x86_64::structures::tss::TaskStateSegment) {
		self.tss.set(tss);
	}

	#[cfg(target_arch = "x86_64")]
	pub(crate) fn tss(&self) -> *mut x86_64::structures::tss::TaskStateSegment {
		self.tss.get()
	}
}

/// All PRCBs, in bring-up order.
static PRCBS: InterruptTicketMutex<Vec<&'static Prcb>> = InterruptTicketMutex::new(Vec::new());

static NEXT_CORE_ID: AtomicU32 = AtomicU32::new(0);

#[inline]
pub(crate) fn try_prcb() -> Option<&'static Prcb> {
	if cfg!(target_os = "none") {
		core_local::try_get()
	} else {
		None
	}
}

#[inline]
pub(crate) fn prcb() -> &'static Prcb {
	core_local::get()
}

pub fn core_id() -> CoreId {
	match try_prcb() {
		Some(prcb) => prcb.id,
		None => 0,
	}
}

pub(crate) fn prcb_by_id(id: CoreId) -> Option<&'static Prcb> {
	PRCBS.lock().get(id as usize).copied()
}

pub(crate) fn online_prcbs() -> Vec<&'static Prcb> {
	PRCBS.lock().clone()
}

/// The current thread of this processor.
pub fn current_thread() -> Arc<Thread> {
	sched::current_thread()
}

/// Brings the executing CPU into the executive: allocates and installs its
/// PRCB, loads the per-CPU descriptor tables, and sets up the idle thread.
///
/// The bootstrap processor additionally allocates the executive's IPI
/// vectors at the highest bucket.
pub fn add_current_core() {
	let id = NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed);
	let hardware_id = crate::env::loader_block()
		.multiprocessor
		.list
		.get(id as usize)
		.map(|info| info.hardware_id)
		.unwrap_or(id);

	let prcb: &'static Prcb = Box::leak(Box::new(Prcb::new(id, hardware_id)));
	PRCBS.lock().push(prcb);
	core_local::install(prcb);
	crate::arch::kernel::add_current_core();

	if id == 0 {
		allocate_executive_vectors();
		process::init_system_process();
	}

	sched::init_current_core(prcb);
	prcb.set_ipl(Ipl::Normal);
	crate::arch::kernel::processor::set_task_priority(Ipl::Normal.into());

	debug!("Processor {id} (hardware id {hardware_id}) is online");
}

/// Vector used to poke a processor into its software-interrupt dispatch.
static DPC_IPI_VECTOR: AtomicU32 = AtomicU32::new(0);
/// Vector of the TLB-shootdown IPI.
static SHOOTDOWN_IPI_VECTOR: AtomicU32 = AtomicU32::new(0);
/// Vector of the crash IPI.
static CRASH_IPI_VECTOR: AtomicU32 = AtomicU32::new(0);

fn allocate_executive_vectors() {
	let dpc = irq::allocate_vector(Ipl::NoInts).expect("out of IPI vectors");
	irq::register_handler(dpc, |_vector| {
		// Arm the local DPC dispatch; the IPL drop on the way out of the
		// interrupt runs it.
		ipl::request_software_interrupt(Ipl::Dpc);
		hal::end_of_interrupt();
	});
	DPC_IPI_VECTOR.store(dpc.into(), Ordering::Release);

	let shootdown = irq::allocate_vector(Ipl::NoInts).expect("out of IPI vectors");
	irq::register_handler(shootdown, |_vector| {
		crate::mm::shootdown_responder();
		hal::end_of_interrupt();
	});
	SHOOTDOWN_IPI_VECTOR.store(shootdown.into(), Ordering::Release);

	let crash = irq::allocate_vector(Ipl::NoInts).expect("out of IPI vectors");
	irq::register_handler(crash, |_vector| {
		crash_secondary();
	});
	CRASH_IPI_VECTOR.store(crash.into(), Ordering::Release);
}

pub(crate) fn shootdown_vector() -> u8 {
	SHOOTDOWN_IPI_VECTOR.load(Ordering::Acquire) as u8
}

pub(crate) fn dpc_ipi_vector() -> u8 {
	DPC_IPI_VECTOR.load(Ordering::Acquire) as u8
}

/// Requests a software interrupt on the executing processor.
///
/// The pending bit alone would only be honored at the next IPL drop; the
/// self-IPI forces such a drop immediately after the write.
pub fn issue_software_interrupt() {
	ipl::request_software_interrupt(Ipl::Dpc);
	let vector = DPC_IPI_VECTOR.load(Ordering::Acquire) as u8;
	if vector != 0 {
		hal::request_self_ipi(vector);
	}
}

static CRASH_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASHED_PROCESSORS: AtomicU32 = AtomicU32::new(0);

pub(crate) fn crash_in_progress() -> bool {
	CRASH_IN_PROGRESS.load(Ordering::Acquire)
}

/// Acknowledges a crash initiated by another processor and halts.
pub(crate) fn crash_secondary() -> ! {
	ipl::disable_interrupts();
	CRASHED_PROCESSORS.fetch_add(1, Ordering::AcqRel);
	loop {
		crate::arch::kernel::processor::halt();
	}
}

/// Stops the system: freezes all peers, then prints the stop message and
/// a register dump over the unlocked console path.
///
/// This is the terminus of every invariant violation in the executive.
pub fn crash(message: fmt::Arguments<'_>) -> ! {
	use core::fmt::Write;

	ipl::disable_interrupts();

	if CRASH_IN_PROGRESS.swap(true, Ordering::AcqRel) {
		// Two processors crashed simultaneously; one wins, the rest halt.
		crash_secondary();
	}

	let id = core_id();
	let peers = crate::processor_count().saturating_sub(1);

	hal::broadcast_crash_ipi(CRASH_IPI_VECTOR.load(Ordering::Acquire) as u8);

	// Give the peers a bounded moment to acknowledge; a wedged CPU must
	// not keep the stop message off the screen.
	let mut patience: u64 = 100_000_000;
	while CRASHED_PROCESSORS.load(Ordering::Acquire) < peers && patience > 0 {
		patience -= 1;
		core::hint::spin_loop();
	}

	struct CrashConsole;

	impl fmt::Write for CrashConsole {
		fn write_str(&mut self, s: &str) -> fmt::Result {
			crate::arch::output_message_unlocked(s.as_bytes());
			Ok(())
		}
	}

	let mut console = CrashConsole;
	writeln!(console, "\n*** STOP (CPU {id}): {message}").ok();

	loop {
		crate::arch::kernel::processor::halt();
	}
}
