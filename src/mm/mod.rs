//! The virtual-memory manager.

pub mod cache;
pub mod clone;
pub mod fault;
pub mod heap;
pub mod mdl;
pub mod mpw;
pub mod pfn;
pub mod pool;
pub mod probe;
pub mod section;
pub mod services;
pub mod sla;
pub mod vad;
pub mod view;

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::config::KERNEL_SPACE_BASE;
use crate::ex::RwLock;
use crate::hal;
use crate::ke::ipl::{self, Ipl};
use crate::ke::spinlock::RawSpin;
use crate::ke::{self, process};

bitflags! {
	/// Page protection requested by a caller.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct Protection: u32 {
		const READ = 1 << 0;
		const WRITE = 1 << 1;
		const EXECUTE = 1 << 2;
	}
}

bitflags! {
	/// How a range of address space is reserved or committed.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct AllocationType: u32 {
		const RESERVE = 1 << 0;
		const COMMIT = 1 << 1;
		/// The mapping is shared rather than private.
		const SHARED = 1 << 2;
		/// Carve the range from the top of the free space.
		const TOP_DOWN = 1 << 3;
		/// Writes resolve through the copy-on-write path.
		const COW = 1 << 4;
	}
}

bitflags! {
	/// What kind of access raised a page fault.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct FaultMode: u32 {
		const WRITE = 1 << 0;
		const USER = 1 << 1;
	}
}

/// Virtual address of `phys` inside the higher-half direct map.
#[inline]
pub fn hhdm_addr(phys: usize) -> usize {
	crate::env::hhdm_base() + phys
}

/// Physical address behind a direct-map pointer.
#[inline]
pub fn hhdm_offset(va: usize) -> usize {
	va - crate::env::hhdm_base()
}

/// Initializes the memory manager on the bootstrap processor: the kernel
/// heap, the page-frame database, and the system-space windows.
pub fn init() {
	pfn::init();

	// The system windows must have root-table entries before the first
	// process copies the kernel half of the root table.
	crate::arch::paging::preallocate_kernel_root_entry(crate::config::POOL_SPACE_BASE)
		.expect("unable to reserve the pool window root entry");
	crate::arch::paging::preallocate_kernel_root_entry(crate::config::VIEW_SPACE_BASE)
		.expect("unable to reserve the view window root entry");

	pool::init();
	view::init();

	info!(
		"Memory manager online: {} pages available",
		pfn::total_free_pages()
	);
}

// Kernel-space VA changes are serialized by a spin lock until every CPU is
// up, then by the executive rwlock so the fault path can read in parallel.

static KERNEL_SPACE_SPIN: RawSpin = RawSpin::new();
static KERNEL_SPACE_SPIN_IPL: AtomicU8 = AtomicU8::new(0);
static KERNEL_SPACE_RWLOCK: hermit_sync::OnceCell<RwLock> = hermit_sync::OnceCell::new();
static USE_KERNEL_RWLOCK: AtomicBool = AtomicBool::new(false);

fn lock_kernel_space(exclusive: bool) {
	if USE_KERNEL_RWLOCK.load(Ordering::Acquire) {
		let lock = KERNEL_SPACE_RWLOCK.get().unwrap();
		if exclusive {
			lock.acquire_exclusive(false, false)
		} else {
			lock.acquire_shared(false, false, false)
		}
		.expect("a non-alertable kernel-space lock acquisition cannot fail");
	} else {
		let old = ipl::raise_if_needed(Ipl::Dpc);
		KERNEL_SPACE_SPIN.lock();
		KERNEL_SPACE_SPIN_IPL.store(old.into(), Ordering::Relaxed);
	}
}

fn unlock_kernel_space() {
	if USE_KERNEL_RWLOCK.load(Ordering::Acquire) {
		KERNEL_SPACE_RWLOCK.get().unwrap().release();
	} else {
		let old = KERNEL_SPACE_SPIN_IPL.load(Ordering::Relaxed);
		KERNEL_SPACE_SPIN.unlock();
		ipl::lower_if_needed(Ipl::try_from(old).unwrap());
	}
}

pub(crate) fn lock_kernel_space_shared() {
	lock_kernel_space(false);
}

pub(crate) fn lock_kernel_space_exclusive() {
	lock_kernel_space(true);
}

/// Swaps the boot spin lock for the rwlock once every processor reached
/// the rendezvous. Called by each CPU late in bring-up.
pub fn switch_kernel_space_lock() {
	static ARRIVALS: AtomicU32 = AtomicU32::new(0);
	static DEPARTURES: AtomicU32 = AtomicU32::new(0);

	let total = crate::env::processor_count() as u32;

	ARRIVALS.fetch_add(1, Ordering::SeqCst);
	while ARRIVALS.load(Ordering::SeqCst) < total {
		core::hint::spin_loop();
	}

	if ke::core_id() == 0 {
		KERNEL_SPACE_RWLOCK.set(RwLock::new()).ok();
		USE_KERNEL_RWLOCK.store(true, Ordering::Release);
	}

	DEPARTURES.fetch_add(1, Ordering::SeqCst);
	while DEPARTURES.load(Ordering::SeqCst) < total {
		core::hint::spin_loop();
	}
}

/// Locks the address space that `deciding_address` belongs to for reading
/// and raises the IPL to `Apc`. Returns the IPL to restore.
pub fn lock_space_shared(deciding_address: usize) -> Ipl {
	let old_ipl = ipl::raise_if_needed(Ipl::Apc);

	if deciding_address >= KERNEL_SPACE_BASE {
		lock_kernel_space_shared();
	} else {
		process::attached_process()
			.address_lock
			.acquire_shared(false, false, false)
			.expect("a non-alertable address-space lock acquisition cannot fail");
	}

	old_ipl
}

/// Locks the address space that `deciding_address` belongs to for
/// modification and raises the IPL to `Apc`.
pub fn lock_space_exclusive(deciding_address: usize) -> Ipl {
	let old_ipl = ipl::raise_if_needed(Ipl::Apc);

	if deciding_address >= KERNEL_SPACE_BASE {
		lock_kernel_space_exclusive();
	} else {
		process::attached_process()
			.address_lock
			.acquire_exclusive(false, false)
			.expect("a non-alertable address-space lock acquisition cannot fail");
	}

	old_ipl
}

pub fn unlock_space(old_ipl: Ipl, deciding_address: usize) {
	if deciding_address >= KERNEL_SPACE_BASE {
		unlock_kernel_space();
	} else {
		process::attached_process().address_lock.release();
	}

	ipl::lower_if_needed(old_ipl);
}

// TLB shootdown. One initiator at a time; each responder invalidates the
// published range and drops its sub-lock, which is the barrier the
// initiator spins on.

static SHOOTDOWN_LOCK: ke::SpinLock<()> = ke::SpinLock::with_level((), Ipl::Ipi);

/// Invalidates `address..address + length` on every processor.
pub fn issue_tlb_shootdown(address: usize, length: usize) {
	invalidate_range(address, length);

	if crate::processor_count() <= 1 {
		return;
	}

	let _guard = SHOOTDOWN_LOCK.lock();
	let me = ke::core_id();

	let peers: smallvec::SmallVec<[&'static ke::Prcb; 16]> = ke::online_prcbs()
		.into_iter()
		.filter(|prcb| prcb.id != me)
		.collect();

	for prcb in &peers {
		while prcb.shootdown.busy.swap(true, Ordering::AcqRel) {
			core::hint::spin_loop();
		}
		prcb.shootdown.address.store(address as u64, Ordering::Relaxed);
		prcb.shootdown.length.store(length as u64, Ordering::Release);
	}

	hal::request_ipi(hal::IpiTarget::Others, ke::shootdown_vector());

	for prcb in &peers {
		while prcb.shootdown.busy.load(Ordering::Acquire) {
			core::hint::spin_loop();
		}
	}
}

/// Runs on the receiving side of the shootdown IPI.
pub(crate) fn shootdown_responder() {
	let Some(prcb) = ke::try_prcb() else {
		return;
	};

	if !prcb.shootdown.busy.load(Ordering::Acquire) {
		return;
	}

	let address = prcb.shootdown.address.load(Ordering::Relaxed) as usize;
	let length = prcb.shootdown.length.load(Ordering::Relaxed) as usize;
	invalidate_range(address, length);

	prcb.shootdown.busy.store(false, Ordering::Release);
}

fn invalidate_range(address: usize, length: usize) {
	use crate::config::PAGE_SIZE;

	let pages = length.div_ceil(PAGE_SIZE);
	if pages > 64 {
		crate::arch::paging::flush_all();
		return;
	}

	for i in 0..pages {
		crate::arch::paging::flush(address + i * PAGE_SIZE);
	}
}
