#![allow(dead_code)]

/// Size of a virtual-memory page.
pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SHIFT: usize = 12;

pub const KERNEL_STACK_SIZE: usize = 0x8000;
pub const DEFAULT_STACK_SIZE: usize = 0x40000;

/// First address of the kernel half of the address space. Everything below
/// belongs to the attached process.
pub const KERNEL_SPACE_BASE: usize = 0xFFFF_8000_0000_0000;

/// Base of the higher-half direct map of physical memory.
pub const HHDM_BASE: usize = 0xFFFF_8000_0000_0000;

/// Base of the page-frame database window.
pub const PFNDB_BASE: usize = 0xFFFF_A000_0000_0000;

/// Window that system-space pool allocations are carved out of.
pub const POOL_SPACE_BASE: usize = 0xFFFF_C000_0000_0000;
pub const POOL_SPACE_SIZE: usize = 0x0000_0010_0000_0000;

/// Window that system-space file views are carved out of.
pub const VIEW_SPACE_BASE: usize = 0xFFFF_D000_0000_0000;
pub const VIEW_SPACE_SIZE: usize = 0x0000_0010_0000_0000;

/// Bottom and size of the user address range handed to each new process.
pub const USER_SPACE_BASE: usize = 0x0000_0000_0040_0000;
pub const USER_SPACE_END: usize = 0x0000_7FFF_F000_0000;

/// Wait blocks embedded in every thread; waits on more objects allocate an
/// external array.
pub const THREAD_WAIT_BLOCKS: usize = 4;
pub const MAXIMUM_WAIT_BLOCKS: usize = 64;

/// Scheduler quantum in timer ticks.
pub const THREAD_QUANTUM_TICKS: u64 = 20;

/// Number of thread priorities. Priority 0 is reserved for the idle thread.
pub const PRIORITY_COUNT: usize = 32;

/// `signaled` value of a mutex that is not owned by anybody.
pub const MUTEX_SIGNALED: i32 = 1;

/// Timers within this many ticks of the current time fire on the next tick.
pub const TIMER_EXPIRY_SLACK_TICKS: u64 = 100;

/// How long a faulting thread sleeps before retrying when the fault handler
/// ran out of physical memory.
pub const REFAULT_SLEEP_MS: u64 = 50;

/// Pages zeroed eagerly while the page-frame database is built.
pub const EAGER_ZERO_PAGES: usize = 200;

/// Upper bound on concurrently mapped system-space file views; mapping past
/// it evicts the least recently used views.
pub const VIEW_CACHE_MAX: usize = 64;

/// Progress-probe timeout used by the executive rwlock, in milliseconds.
pub const RWLOCK_WAIT_TIMEOUT_MS: u64 = 300;

/// Interrupt vectors per IPL bucket.
pub const VECTORS_PER_IPL: usize = 16;
