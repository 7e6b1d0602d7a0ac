//! The stopped clock, fixed at a time that tests can move around.
use std::time::Duration;

use magpie_primitives::DurationSinceUnixEpoch;

use crate::clock;
use crate::clock::{StoppedTime, Time};

#[allow(clippy::module_name_repetitions)]
pub struct StoppedClock {}

impl Time for clock::Stopped {
    fn now() -> DurationSinceUnixEpoch {
        detail::FIXED_TIME.with(|time| *time.borrow())
    }
}

impl StoppedTime for clock::Stopped {
    fn local_set(unix_time: &DurationSinceUnixEpoch) {
        detail::FIXED_TIME.with(|time| {
            *time.borrow_mut() = *unix_time;
        });
    }

    fn local_set_to_system_time_now() {
        Self::local_set(&detail::system_time_now());
    }

    fn local_add(duration: &Duration) {
        detail::FIXED_TIME.with(|time| {
            let now = *time.borrow();
            *time.borrow_mut() = now.checked_add(*duration).expect("the stopped clock should not overflow");
        });
    }

    fn local_sub(duration: &Duration) {
        detail::FIXED_TIME.with(|time| {
            let now = *time.borrow();
            *time.borrow_mut() = now.checked_sub(*duration).expect("the stopped clock should not underflow");
        });
    }
}

mod detail {
    use std::cell::RefCell;
    use std::time::SystemTime;

    use magpie_primitives::DurationSinceUnixEpoch;

    thread_local!(pub static FIXED_TIME: RefCell<DurationSinceUnixEpoch> = const { RefCell::new(DurationSinceUnixEpoch::ZERO) });

    pub fn system_time_now() -> DurationSinceUnixEpoch {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("the system clock should not be set before the Unix Epoch")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::clock::{Stopped, StoppedTime, Time};

    #[test]
    fn it_should_default_to_the_unix_epoch() {
        Stopped::local_set_to_unix_epoch();

        assert_eq!(Stopped::now(), Duration::ZERO);
    }

    #[test]
    fn it_should_be_settable_to_a_fixed_time() {
        Stopped::local_set(&Duration::from_secs(100));

        assert_eq!(Stopped::now(), Duration::from_secs(100));
    }

    #[test]
    fn it_should_move_forwards_and_backwards() {
        Stopped::local_set(&Duration::from_secs(100));

        Stopped::local_add(&Duration::from_secs(10));
        assert_eq!(Stopped::now(), Duration::from_secs(110));

        Stopped::local_sub(&Duration::from_secs(20));
        assert_eq!(Stopped::now(), Duration::from_secs(90));
    }
}
