//! The I/O core: file control blocks, file objects, pipes, partitions,
//! and the read/write plumbing the virtual-memory paging paths consume.

pub mod fcb;
pub mod file;
pub mod part;
pub mod pipe;
pub mod rdwr;

pub use self::fcb::{DirectoryEntry, DispatchFlags, Fcb, FcbDispatch, FileType, RwFlags};
pub use self::file::{FileFlags, FileObject};
pub use self::rdwr::IoStatusBlock;

pub fn init() {
	debug!("I/O core online");
}
