//! Time related functions and types.
//!
//! It's usually a good idea to control where the time comes from in an
//! application so that it can be mocked for testing and we get the intended
//! behavior without relying on the underlying system clock.
//!
//! Clocks produce a `DurationSinceUnixEpoch` (see `magpie_primitives`), a
//! `std::time::Duration` since the Unix Epoch: a timestamp that does not
//! depend on the time zone.
//!
//! Consumers declare a `CurrentClock` alias that resolves to [`Working`] in
//! production builds and [`Stopped`] under `cfg(test)`, so that sweeps and
//! expiry logic can be driven deterministically from tests:
//!
//! ```rust
//! use magpie_clock::{clock, Time};
//!
//! #[cfg(not(test))]
//! type CurrentClock = clock::Working;
//! #[cfg(test)]
//! type CurrentClock = clock::Stopped;
//!
//! let _now = CurrentClock::now();
//! ```
pub mod clock;

pub use crate::clock::{StoppedTime, Time};

/// Working version, for production.
#[cfg(not(test))]
#[allow(dead_code)]
pub(crate) type CurrentClock = clock::Working;

/// Stopped version, for testing.
#[cfg(test)]
#[allow(dead_code)]
pub(crate) type CurrentClock = clock::Stopped;
