//! Access to the loader-parameter block handed over by the boot shim.
//!
//! The bootstrap path converts whatever the bootloader provides into one
//! [`LoaderBlock`] before the kernel proper runs; everything the executive
//! knows about the machine comes from here.

use hermit_sync::OnceCell;

/// Classification of a physical memory region reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
	Free,
	Reserved,
	BadMemory,
	AcpiReclaim,
	LoaderReclaim,
	LoadedProgram,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
	pub base: usize,
	pub size: usize,
	pub kind: MemoryRegionKind,
}

#[derive(Debug, Clone, Copy)]
pub struct Module {
	pub address: usize,
	pub size: usize,
	pub path: &'static str,
	pub string: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
	pub kernel: Module,
	pub list: &'static [Module],
}

/// One processor as enumerated by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorInfo {
	pub processor_id: u32,
	pub hardware_id: u32,
	pub trampoline_jump_address: usize,
	pub extra_argument: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct MultiprocessorInfo {
	pub bootstrap_hardware_id: u32,
	pub list: &'static [ProcessorInfo],
}

#[derive(Debug, Clone, Copy)]
pub struct Framebuffer {
	pub address: usize,
	pub pitch: u32,
	pub width: u32,
	pub height: u32,
	pub bit_depth: u8,
	pub red_mask_size: u8,
	pub red_mask_shift: u8,
	pub green_mask_size: u8,
	pub green_mask_shift: u8,
	pub blue_mask_size: u8,
	pub blue_mask_shift: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderInfo {
	pub name: &'static str,
	pub version: &'static str,
}

/// The loader-parameter block.
#[derive(Debug)]
pub struct LoaderBlock {
	pub memory_regions: &'static [MemoryRegion],
	pub hhdm_base: usize,
	pub module_info: ModuleInfo,
	pub multiprocessor: MultiprocessorInfo,
	pub framebuffers: &'static [Framebuffer],
	pub command_line: &'static str,
	pub loader_info: LoaderInfo,
	pub rsdp_address: usize,
}

static LOADER_BLOCK: OnceCell<&'static LoaderBlock> = OnceCell::new();

pub(crate) fn set_loader_block(loader_block: &'static LoaderBlock) {
	LOADER_BLOCK
		.set(loader_block)
		.expect("the loader block must only be registered once");
}

/// The loader-parameter block of this boot.
///
/// Panics when called before [`set_loader_block`].
pub fn loader_block() -> &'static LoaderBlock {
	LOADER_BLOCK
		.get()
		.expect("the loader block has not been registered yet")
}

pub fn hhdm_base() -> usize {
	loader_block().hhdm_base
}

pub fn command_line() -> &'static str {
	loader_block().command_line
}

/// Number of processors the bootloader enumerated, including the bootstrap
/// processor.
pub fn processor_count() -> usize {
	if cfg!(feature = "smp") {
		loader_block().multiprocessor.list.len().max(1)
	} else {
		1
	}
}
