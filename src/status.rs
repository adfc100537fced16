use thiserror::Error;

/// Error kinds surfaced by the executive.
///
/// `Ok(())` takes the place of a success status; wait APIs return the index
/// of the satisfied object instead. The break codes [`Timeout`],
/// [`Alerted`] and [`Killed`] always travel to the caller of the wait;
/// [`Refault`] and [`RefaultSleep`] never leave the page-fault entry point.
///
/// [`Timeout`]: KeStatus::Timeout
/// [`Alerted`]: KeStatus::Alerted
/// [`Killed`]: KeStatus::Killed
/// [`Refault`]: KeStatus::Refault
/// [`RefaultSleep`]: KeStatus::RefaultSleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeStatus {
	#[error("insufficient memory")]
	InsufficientMemory,
	#[error("invalid parameter")]
	InvalidParameter,
	#[error("object type mismatch")]
	TypeMismatch,
	#[error("access violation")]
	AccessViolation,
	#[error("conflicting addresses")]
	ConflictingAddresses,
	#[error("not linked")]
	NotLinked,
	#[error("already linked")]
	AlreadyLinked,
	#[error("unsupported function")]
	UnsupportedFunction,
	#[error("unimplemented")]
	Unimplemented,
	#[error("end of file")]
	EndOfFile,
	#[error("out of file bounds")]
	OutOfFileBounds,
	#[error("refault")]
	Refault,
	#[error("refault after sleep")]
	RefaultSleep,
	#[error("more processing required")]
	MoreProcessingRequired,
	#[error("timeout")]
	Timeout,
	#[error("wait alerted")]
	Alerted,
	#[error("thread killed")]
	Killed,
	#[error("hardware I/O error")]
	HardwareIoError,
	#[error("name not found")]
	NameNotFound,
	#[error("invalid executable")]
	InvalidExecutable,
}

pub type Status<T = ()> = Result<T, KeStatus>;
