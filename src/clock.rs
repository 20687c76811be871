//! Shared time. Every node in the installation agrees on a [`VirtualTime`],
//! a number of seconds that means the same instant on the server and on
//! every client, and maps it onto its own [`LocalTime`], the time base of
//! its audio engine.
//!
//! Clock synchronization itself (round-trip estimation and friends) lives
//! outside this crate, behind the [`VirtualClock`] trait. The core only asks
//! two things of it: a mapping in each direction, and an honest answer when
//! it has not converged yet.

/// Network-agreed time in seconds.
pub type VirtualTime = f64;

/// Device-local audio rendering time in seconds.
pub type LocalTime = f64;

/// A clock collaborator mapping between device-local rendering time and the
/// shared [`VirtualTime`].
///
/// Implementations must be monotonic. The core does not handle clock resets.
pub trait VirtualClock {
    /// Returns the virtual time corresponding to `local`, or `None` while the
    /// clock has not converged. Callers defer playback instead of guessing.
    fn to_virtual_time(&self, local: LocalTime) -> Option<VirtualTime>;

    /// Maps a virtual time onto this device's rendering time base.
    fn to_local_time(&self, time: VirtualTime) -> LocalTime;

    /// The current virtual time, given the engine's current local time.
    fn now(&self, local_now: LocalTime) -> Option<VirtualTime> {
        self.to_virtual_time(local_now)
    }
}

/// A [`VirtualClock`] that sits a fixed offset away from local time, the
/// state a synchronization service settles into once it has converged.
/// Used by the simulator and the tests to stand in for independently
/// clocked devices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetClock {
    offset: f64,
    converged: bool,
}

impl OffsetClock {
    /// A converged clock where `virtual = local + offset`.
    pub fn new(offset: f64) -> Self {
        Self {
            offset,
            converged: true,
        }
    }

    /// A clock that has not converged yet; see [`OffsetClock::converge`].
    pub fn unsynchronized(offset: f64) -> Self {
        Self {
            offset,
            converged: false,
        }
    }

    /// Marks the clock as converged.
    pub fn converge(&mut self) {
        self.converged = true;
    }

    /// Whether the clock currently yields virtual times.
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// The offset between virtual and local time.
    pub fn offset(&self) -> f64 {
        self.offset
    }
}

impl VirtualClock for OffsetClock {
    fn to_virtual_time(&self, local: LocalTime) -> Option<VirtualTime> {
        self.converged.then_some(local + self.offset)
    }

    fn to_local_time(&self, time: VirtualTime) -> LocalTime {
        time - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_clock_maps_both_ways() {
        let clock = OffsetClock::new(12.5);
        assert_eq!(clock.to_virtual_time(1.0), Some(13.5));
        assert_eq!(clock.to_local_time(13.5), 1.0);
        assert_eq!(clock.now(2.0), Some(14.5));
    }

    #[test]
    fn unsynchronized_clock_yields_nothing() {
        let mut clock = OffsetClock::unsynchronized(3.0);
        assert_eq!(clock.now(1.0), None);
        clock.converge();
        assert_eq!(clock.now(1.0), Some(4.0));
    }
}
