pub mod kernel;
pub mod mm;

pub use self::kernel::{
	boot_processor_init, message_output_init, output_message_buf, output_message_unlocked,
};
#[cfg(feature = "smp")]
pub use self::kernel::{application_processor_init, boot_application_processors};
pub use self::mm::paging;
