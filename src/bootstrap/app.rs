//! Setup for the crawler application.
//!
//! [`setup`] only loads the configuration and initialises logging; starting
//! the jobs is [`crate::app::start`]'s business.
use std::path::PathBuf;

use magpie_configuration::Configuration;

use super::{config, logging};

/// Loads the configuration and sets up logging from it.
///
/// # Panics
///
/// Will panic if the configuration cannot be loaded or carries an unknown
/// logging threshold.
#[must_use]
pub fn setup(config_path: Option<PathBuf>) -> Configuration {
    let configuration = config::initialize_configuration(config_path);

    logging::setup(&configuration);

    configuration
}
