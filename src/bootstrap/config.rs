//! Initialize configuration from a file or environment variables.
//!
//! The whole configuration can be injected through the `MAGPIE_CONFIG_TOML`
//! env var (same content as the file), which has priority over the file
//! path. Individual options can be overridden with
//! `MAGPIE_CONFIG_OVERRIDE_`-prefixed variables.
use std::path::PathBuf;

use magpie_configuration::{Configuration, Info};

/// Loads the application configuration from the environment, with an
/// optional file-path override from the command line.
///
/// # Panics
///
/// Will panic if the configuration cannot be loaded: a crawler with a
/// half-read configuration is not worth starting.
#[must_use]
pub fn initialize_configuration(config_path: Option<PathBuf>) -> Configuration {
    let mut info = Info::from_env();

    if let Some(path) = config_path {
        info.config_toml_path = path.display().to_string();
    }

    Configuration::load(&info).expect("the configuration should load")
}
