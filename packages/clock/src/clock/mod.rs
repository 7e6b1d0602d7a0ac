//! The working and stopped clocks.
use std::time::Duration;

use magpie_primitives::DurationSinceUnixEpoch;

pub mod stopped;
pub mod working;

/// A generic structure that represents a clock.
///
/// It can be either the working clock (production) or the stopped clock
/// (testing). It implements the [`Time`] trait, which gives you the current
/// time.
#[derive(Debug)]
pub struct Clock<T> {
    clock: std::marker::PhantomData<T>,
}

/// The working clock. It returns the current time.
pub type Working = Clock<working::WorkingClock>;

/// The stopped clock. It returns always the same fixed time.
pub type Stopped = Clock<stopped::StoppedClock>;

/// Trait for types that can be used as a timestamp clock.
pub trait Time: Sized {
    fn now() -> DurationSinceUnixEpoch;

    #[must_use]
    fn now_add(add_time: &Duration) -> Option<DurationSinceUnixEpoch> {
        Self::now().checked_add(*add_time)
    }

    #[must_use]
    fn now_sub(sub_time: &Duration) -> Option<DurationSinceUnixEpoch> {
        Self::now().checked_sub(*sub_time)
    }
}

/// Trait for clocks stopped at a given time, which tests can move around.
pub trait StoppedTime: Time {
    /// It sets the clock to the given time.
    fn local_set(unix_time: &DurationSinceUnixEpoch);

    /// It sets the clock to the Unix Epoch.
    fn local_set_to_unix_epoch() {
        Self::local_set(&DurationSinceUnixEpoch::ZERO);
    }

    /// It sets the clock to the current system time.
    fn local_set_to_system_time_now();

    /// It adds a `Duration` to the clock.
    fn local_add(duration: &Duration);

    /// It subtracts a `Duration` from the clock.
    fn local_sub(duration: &Duration);
}
