//! Host-platform services the run loop depends on.

/// Signal and timing services of the hosting kernel. The run loop only
/// ever polls; it never blocks inside the shim.
pub trait Platform {
    /// True when a signal is pending for the calling thread.
    fn interrupted(&self) -> bool;

    /// Sleep the calling thread; used to honor a child's yield.
    fn sleep_us(&self, usec: u64);
}

/// A platform that is never interrupted and never sleeps; useful for
/// tests and for polled bring-up environments.
pub struct NullPlatform;

impl Platform for NullPlatform {
    fn interrupted(&self) -> bool {
        false
    }

    fn sleep_us(&self, _usec: u64) {}
}
