use x86_64::VirtAddr;
use x86_64::registers::model_specific::GsBase;

use crate::ke::Prcb;

/// Publishes the processor control block of this CPU through `GS`.
///
/// Every later [`get`] on this CPU returns exactly this reference.
pub(crate) fn install(prcb: &'static Prcb) {
	assert_eq!(VirtAddr::zero(), GsBase::read());
	GsBase::write(VirtAddr::from_ptr(prcb));
}

#[inline]
pub(crate) fn try_get() -> Option<&'static Prcb> {
	let base = GsBase::read();
	if base == VirtAddr::zero() {
		None
	} else {
		Some(unsafe { &*base.as_ptr() })
	}
}

/// The processor control block of the executing CPU.
///
/// Panics before [`install`]; early code must use [`try_get`].
#[inline]
pub(crate) fn get() -> &'static Prcb {
	try_get().expect("the PRCB of this processor has not been installed yet")
}
