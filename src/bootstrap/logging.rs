//! Setup for the application logging.
//!
//! It redirects the tracing output to stdout with the threshold defined in
//! the configuration (case is ignored):
//!
//! - `Off` (i.e. don't load any subscriber)
//! - `Error`
//! - `Warn`
//! - `Info`
//! - `Debug`
//! - `Trace`
use std::sync::Once;

use magpie_configuration::Configuration;
use tracing::debug;
use tracing::level_filters::LevelFilter;

static INIT: Once = Once::new();

/// It redirects the tracing output to stdout with the threshold defined in
/// the configuration.
///
/// # Panics
///
/// Will panic if the threshold in the configuration is not one of the known
/// level names.
pub fn setup(cfg: &Configuration) {
    let filter = threshold_filter(&cfg.logging.threshold);

    if filter == LevelFilter::OFF {
        return;
    }

    INIT.call_once(|| {
        stdout_init(filter);
    });
}

fn threshold_filter(threshold: &str) -> LevelFilter {
    threshold.parse().unwrap_or_else(|_| {
        panic!(
            "
Error! Unrecognized logging `threshold`!

           Found:     \"{threshold}\"

But, the possible values are:
                    - `off`
                    - `error` (strongest)
                    - `warn`
    (default)  ---> - `info`
                    - `debug`
                    - `trace` (weakest)
"
        )
    })
}

fn stdout_init(filter: LevelFilter) {
    tracing_subscriber::fmt().with_max_level(filter).init();

    debug!("logging initialized.");
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::threshold_filter;

    #[test]
    fn it_should_parse_the_known_levels_case_insensitively() {
        assert_eq!(threshold_filter("info"), LevelFilter::INFO);
        assert_eq!(threshold_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(threshold_filter("off"), LevelFilter::OFF);
    }

    #[test]
    #[should_panic(expected = "Unrecognized logging")]
    fn it_should_refuse_an_unknown_level() {
        drop(threshold_filter("loud"));
    }
}
