//! The physical-memory manager: the page-frame database.
//!
//! One [`PageFrame`] per physical page, laid out as a contiguous array in
//! the kernel's database window and indexed by page-frame number. Pages
//! live on one of four lists — free, zeroed, standby, modified — linked
//! through their database entries; a single spin lock guards the lists and
//! every entry.
//!
//! During boot the loader memory map is scanned twice: the first pass
//! sparsely maps the database pages every usable region needs, the second
//! initializes the entries and strings them onto the free list.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use hermit_sync::InterruptTicketMutex;

use crate::arch::paging::{self, PteFlags};
use crate::config::{EAGER_ZERO_PAGES, PAGE_SHIFT, PAGE_SIZE, PFNDB_BASE};
use crate::env::{self, MemoryRegionKind};
use crate::mm::hhdm_addr;

/// A page-frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pfn(pub u32);

pub const PFN_INVALID: Pfn = Pfn(u32::MAX);

impl Pfn {
	#[inline]
	pub fn from_address(phys: usize) -> Self {
		Pfn((phys >> PAGE_SHIFT) as u32)
	}

	#[inline]
	pub fn address(self) -> usize {
		(self.0 as usize) << PAGE_SHIFT
	}

	#[inline]
	pub fn is_valid(self) -> bool {
		self != PFN_INVALID
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
	Free = 0,
	Zeroed,
	Used,
	Standby,
	Modified,
	Bad,
}

/// One entry of the page-frame database.
#[repr(C)]
pub struct PageFrame {
	pub kind: FrameKind,
	/// Dirty with respect to the backing file.
	pub modified: bool,
	pub refcount: u32,
	next: Pfn,
	prev: Pfn,
	/// Back-pointer to the page-cache or section entry referencing this
	/// frame. A weak edge: it identifies the entry for reclaim and is only
	/// dereferenced under the database lock.
	pub prototype: *mut u64,
	/// File this frame caches a page of, if any; identity for the
	/// modified-page writer. The file purges its cache before it dies, so
	/// a non-null pointer here is always alive.
	pub cache_fcb: *const crate::io::fcb::Fcb,
	/// Page offset of this frame within `cache_fcb`.
	pub cache_offset_page: u64,
}

/// Head and tail of one intrusive frame list.
#[derive(Clone, Copy)]
struct FrameList {
	first: Pfn,
	last: Pfn,
}

impl FrameList {
	const EMPTY: FrameList = FrameList {
		first: PFN_INVALID,
		last: PFN_INVALID,
	};
}

/// The database proper. All access happens through [`with_database`].
pub struct PfnDatabase {
	free: FrameList,
	zeroed: FrameList,
	standby: FrameList,
	modified: FrameList,
	free_pages: usize,
	total_pages: usize,
}

static PFN_DB: InterruptTicketMutex<PfnDatabase> = InterruptTicketMutex::new(PfnDatabase {
	free: FrameList::EMPTY,
	zeroed: FrameList::EMPTY,
	standby: FrameList::EMPTY,
	modified: FrameList::EMPTY,
	free_pages: 0,
	total_pages: 0,
});

/// Runs `f` with the database lock held.
pub(crate) fn with_database<R>(f: impl FnOnce(&mut PfnDatabase) -> R) -> R {
	f(&mut PFN_DB.lock())
}

impl PfnDatabase {
	/// The database entry of `pfn`.
	///
	/// The window mapping for every usable frame was established during
	/// init, so the access cannot fault.
	pub fn entry(&mut self, pfn: Pfn) -> &mut PageFrame {
		debug_assert!(pfn.is_valid());
		unsafe { &mut *(PFNDB_BASE as *mut PageFrame).add(pfn.0 as usize) }
	}

	fn list(&mut self, kind: FrameKind) -> &mut FrameList {
		match kind {
			FrameKind::Free => &mut self.free,
			FrameKind::Zeroed => &mut self.zeroed,
			FrameKind::Standby => &mut self.standby,
			FrameKind::Modified => &mut self.modified,
			_ => unreachable!("frame kind {kind:?} has no list"),
		}
	}

	fn unlink(&mut self, kind: FrameKind, pfn: Pfn) {
		let (next, prev) = {
			let entry = self.entry(pfn);
			(entry.next, entry.prev)
		};

		if next.is_valid() {
			self.entry(next).prev = prev;
		}
		if prev.is_valid() {
			self.entry(prev).next = next;
		}

		let list = self.list(kind);
		if list.first == pfn {
			list.first = next;
		}
		if list.last == pfn {
			list.last = prev;
		}
	}

	fn link_tail(&mut self, kind: FrameKind, pfn: Pfn) {
		let last = self.list(kind).last;

		{
			let entry = self.entry(pfn);
			entry.next = PFN_INVALID;
			entry.prev = last;
			entry.kind = kind;
		}

		if last.is_valid() {
			self.entry(last).next = pfn;
		}

		let list = self.list(kind);
		list.last = pfn;
		if !list.first.is_valid() {
			list.first = pfn;
		}
	}

	fn pop_head(&mut self, kind: FrameKind) -> Option<Pfn> {
		let first = self.list(kind).first;
		if !first.is_valid() {
			return None;
		}
		self.unlink(kind, first);
		Some(first)
	}

	/// Takes one frame off the zeroed list, falling back to the free list
	/// and finally to reclaiming a standby frame.
	pub fn allocate(&mut self) -> Option<Pfn> {
		let pfn = self
			.pop_head(FrameKind::Zeroed)
			.or_else(|| self.pop_head(FrameKind::Free))
			.or_else(|| self.reclaim_standby())?;

		let entry = self.entry(pfn);
		entry.kind = FrameKind::Used;
		entry.refcount = 1;
		entry.modified = false;
		entry.prototype = ptr::null_mut();
		entry.cache_fcb = ptr::null();
		entry.cache_offset_page = 0;

		self.free_pages -= 1;
		Some(pfn)
	}

	/// Steals the oldest standby frame from its cache entry.
	fn reclaim_standby(&mut self) -> Option<Pfn> {
		let pfn = self.pop_head(FrameKind::Standby)?;

		// The cache entry still names this frame; sever that edge so a
		// concurrent cached lookup (which re-reads the entry under this
		// lock) cannot resurrect it.
		let prototype = self.entry(pfn).prototype;
		if !prototype.is_null() {
			unsafe {
				ptr::write_volatile(prototype, 0);
			}
		}
		{
			let entry = self.entry(pfn);
			entry.prototype = ptr::null_mut();
			entry.cache_fcb = ptr::null();
		}

		// Standby frames already count as free; `allocate` adjusts the
		// counter once the frame is handed out.
		Some(pfn)
	}

	pub fn add_reference(&mut self, pfn: Pfn) {
		let entry = self.entry(pfn);
		debug_assert_eq!(entry.kind, FrameKind::Used);
		entry.refcount += 1;
	}

	/// Upgrades a weak cache reference into a real one.
	///
	/// The frame a cache entry names may sit on the standby or modified
	/// list with no references left; taking it back into use must happen
	/// under this lock, before reclaim can steal it.
	pub fn reference_cached(&mut self, pfn: Pfn) -> bool {
		match self.entry(pfn).kind {
			FrameKind::Used => {
				self.entry(pfn).refcount += 1;
				true
			}
			FrameKind::Standby => {
				self.unlink(FrameKind::Standby, pfn);
				let entry = self.entry(pfn);
				entry.kind = FrameKind::Used;
				entry.refcount = 1;
				self.free_pages -= 1;
				true
			}
			FrameKind::Modified => {
				self.unlink(FrameKind::Modified, pfn);
				let entry = self.entry(pfn);
				entry.kind = FrameKind::Used;
				entry.refcount = 1;
				true
			}
			_ => false,
		}
	}

	/// Detaches a frame from its cache entry, freeing it if nothing else
	/// references it. Used when a file's cache is torn down.
	pub fn purge_cached(&mut self, pfn: Pfn) {
		let kind = self.entry(pfn).kind;
		match kind {
			FrameKind::Standby => {
				self.unlink(FrameKind::Standby, pfn);
				let entry = self.entry(pfn);
				entry.prototype = core::ptr::null_mut();
				entry.cache_fcb = core::ptr::null();
				entry.modified = false;
				self.link_tail(FrameKind::Free, pfn);
			}
			FrameKind::Modified => {
				self.unlink(FrameKind::Modified, pfn);
				let entry = self.entry(pfn);
				entry.prototype = core::ptr::null_mut();
				entry.cache_fcb = core::ptr::null();
				entry.modified = false;
				self.link_tail(FrameKind::Free, pfn);
				self.free_pages += 1;
			}
			FrameKind::Used => {
				// Somebody still maps it; just sever the cache edge so
				// the final release frees it outright.
				let entry = self.entry(pfn);
				entry.prototype = core::ptr::null_mut();
				entry.cache_fcb = core::ptr::null();
				entry.modified = false;
			}
			_ => {}
		}
	}

	pub fn reference_count(&mut self, pfn: Pfn) -> u32 {
		self.entry(pfn).refcount
	}

	/// Drops one reference; the last one returns the frame to the free
	/// list, or to the modified/standby list when a cache entry still
	/// names it.
	pub fn release(&mut self, pfn: Pfn) {
		let entry = self.entry(pfn);
		assert_eq!(entry.kind, FrameKind::Used, "releasing a frame that is not in use");
		assert!(entry.refcount > 0, "frame reference count underflow");

		entry.refcount -= 1;
		if entry.refcount > 0 {
			return;
		}

		if !entry.prototype.is_null() {
			// Still part of a file cache: dirty pages queue for the
			// modified-page writer, clean ones become reclaimable.
			if entry.modified {
				self.link_tail(FrameKind::Modified, pfn);
			} else {
				self.link_tail(FrameKind::Standby, pfn);
				self.free_pages += 1;
			}
			return;
		}

		self.link_tail(FrameKind::Free, pfn);
		self.free_pages += 1;
	}

	/// Marks `pfn` dirty with respect to its backing file.
	pub fn mark_modified(&mut self, pfn: Pfn) {
		self.entry(pfn).modified = true;
	}

	/// Records the cache entry that names this frame.
	pub fn set_prototype(&mut self, pfn: Pfn, prototype: *mut u64) {
		self.entry(pfn).prototype = prototype;
	}

	/// Takes one frame off the modified list for writing, holding an
	/// extra reference so a concurrent release cannot requeue it.
	pub fn take_modified_for_write(&mut self) -> Option<Pfn> {
		let pfn = self.pop_head(FrameKind::Modified)?;
		let entry = self.entry(pfn);
		entry.kind = FrameKind::Used;
		entry.refcount = 1;
		entry.modified = false;
		Some(pfn)
	}

	/// Requeues a frame whose write-out failed.
	pub fn requeue_modified(&mut self, pfn: Pfn) {
		let entry = self.entry(pfn);
		debug_assert_eq!(entry.kind, FrameKind::Used);
		entry.refcount -= 1;
		debug_assert_eq!(entry.refcount, 0);
		entry.modified = true;
		self.link_tail(FrameKind::Modified, pfn);
	}

	/// Retires the writer's reference after a successful write-out,
	/// landing the frame on the standby list.
	pub fn finish_modified_write(&mut self, pfn: Pfn) {
		let entry = self.entry(pfn);
		debug_assert_eq!(entry.kind, FrameKind::Used);
		entry.refcount -= 1;

		if entry.refcount == 0 {
			if entry.prototype.is_null() {
				self.link_tail(FrameKind::Free, pfn);
			} else {
				self.link_tail(FrameKind::Standby, pfn);
			}
			self.free_pages += 1;
		}
	}

	pub fn has_modified_pages(&self) -> bool {
		self.modified.first.is_valid()
	}

	/// Moves one free frame to the zeroed list, clearing it through the
	/// direct map.
	pub fn zero_one_frame(&mut self) -> bool {
		let Some(pfn) = self.pop_head(FrameKind::Free) else {
			return false;
		};

		unsafe {
			ptr::write_bytes(hhdm_addr(pfn.address()) as *mut u8, 0, PAGE_SIZE);
		}
		self.link_tail(FrameKind::Zeroed, pfn);
		true
	}
}

/// Allocates one physical page; zeroed frames are preferred.
pub fn allocate_physical_page() -> Option<Pfn> {
	with_database(|db| db.allocate())
}

/// Drops one reference to `pfn`, freeing it at zero.
pub fn free_physical_page(pfn: Pfn) {
	with_database(|db| db.release(pfn));
}

pub fn page_add_reference(pfn: Pfn) {
	with_database(|db| db.add_reference(pfn));
}

/// Allocates a physical page and returns its direct-map address.
pub fn allocate_physical_page_hhdm() -> Option<*mut u8> {
	let pfn = allocate_physical_page()?;
	Some(hhdm_addr(pfn.address()) as *mut u8)
}

pub fn free_physical_page_hhdm(page: *mut u8) {
	free_physical_page(Pfn::from_address(crate::mm::hhdm_offset(page as usize)));
}

pub fn total_free_pages() -> usize {
	PFN_DB.lock().free_pages
}

/// Opportunistically zeroes one free page; the idle loop calls this so
/// allocations mostly find pre-zeroed frames.
pub fn lazy_zero_page() {
	with_database(|db| {
		db.zero_one_frame();
	});
}

// Boot-time carving of the loader memory map. Pages taken here never enter
// the database.

const MAX_BOOT_REGIONS: usize = 128;

/// Bytes of each free region consumed by the boot allocator.
static CONSUMED: [AtomicUsize; MAX_BOOT_REGIONS] =
	[const { AtomicUsize::new(0) }; MAX_BOOT_REGIONS];

/// Takes `count` pages off the front of the first free region that still
/// has them. Infallible failure is a boot-stopping condition.
fn boot_take_pages(count: usize) -> usize {
	let regions = env::loader_block().memory_regions;

	for (i, region) in regions.iter().enumerate().take(MAX_BOOT_REGIONS) {
		if region.kind != MemoryRegionKind::Free {
			continue;
		}

		let consumed = CONSUMED[i].load(Ordering::Relaxed);
		if region.size - consumed >= count * PAGE_SIZE {
			CONSUMED[i].store(consumed + count * PAGE_SIZE, Ordering::Relaxed);
			return region.base + consumed;
		}
	}

	crate::ke::crash(format_args!(
		"out of boot memory while requesting {count} pages"
	));
}

/// Size of the kernel heap slab claimed before the database exists.
const BOOT_HEAP_BYTES: usize = 16 * 1024 * 1024;

/// Builds the page-frame database from the loader memory map.
pub(crate) fn init() {
	let regions = env::loader_block().memory_regions;

	for region in regions {
		if region.kind == MemoryRegionKind::Free {
			debug!(
				"usable memory: {:#x}..{:#x} ({} pages)",
				region.base,
				region.base + region.size,
				region.size / PAGE_SIZE
			);
		}
	}

	// The kernel heap has to exist before the first `alloc` call.
	let heap_base = boot_take_pages(BOOT_HEAP_BYTES / PAGE_SIZE);
	unsafe {
		crate::claim_heap_region(hhdm_addr(heap_base) as *mut u8, BOOT_HEAP_BYTES);
	}

	// Pass 1: sparsely map the database pages every usable frame needs.
	let root = paging::current_page_mapping();
	let mut allocate = || {
		let phys = boot_take_pages(1);
		Some(phys as u64)
	};
	let mut mapped_pages = 0usize;
	let mut last_mapped = 0usize;

	for (i, region) in regions.iter().enumerate().take(MAX_BOOT_REGIONS) {
		if region.kind != MemoryRegionKind::Free {
			continue;
		}

		let start = Pfn::from_address(region.base).0 as usize;
		let end = Pfn::from_address(region.base + region.size).0 as usize;

		for pfn in start..end {
			let entry_va =
				align_down!(PFNDB_BASE + pfn * core::mem::size_of::<PageFrame>(), PAGE_SIZE);
			if entry_va == last_mapped {
				continue;
			}

			unsafe {
				if !paging::boot_map_page_if_absent(
					root,
					entry_va,
					PteFlags::PRESENT
						| PteFlags::WRITABLE | PteFlags::GLOBAL
						| PteFlags::EXECUTE_DISABLE,
					&mut allocate,
				) {
					crate::ke::crash(format_args!("unable to map the page-frame database"));
				}
			}

			last_mapped = entry_va;
			mapped_pages += 1;
		}
	}

	debug!(
		"page-frame database: reserved {} pages ({} KiB)",
		mapped_pages,
		mapped_pages * PAGE_SIZE / 1024
	);

	// Pass 2: initialize the entries and link everything onto the free
	// list, skipping whatever the boot allocator already handed out.
	let mut db = PFN_DB.lock();

	for (i, region) in regions.iter().enumerate().take(MAX_BOOT_REGIONS) {
		if region.kind != MemoryRegionKind::Free {
			continue;
		}

		let consumed = CONSUMED[i].load(Ordering::Relaxed);
		let start = Pfn::from_address(region.base + consumed).0;
		let end = Pfn::from_address(region.base + region.size).0;

		for pfn in start..end {
			let pfn = Pfn(pfn);
			{
				let entry = db.entry(pfn);
				entry.kind = FrameKind::Free;
				entry.modified = false;
				entry.refcount = 0;
				entry.prototype = ptr::null_mut();
				entry.cache_fcb = ptr::null();
				entry.cache_offset_page = 0;
				entry.next = PFN_INVALID;
				entry.prev = PFN_INVALID;
			}
			db.link_tail(FrameKind::Free, pfn);
			db.free_pages += 1;
			db.total_pages += 1;
		}
	}

	for _ in 0..EAGER_ZERO_PAGES {
		if !db.zero_one_frame() {
			break;
		}
	}
}
