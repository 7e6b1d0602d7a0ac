//! Configuration data structures for the magpie crawler.
//!
//! The configuration is loaded from a [TOML](https://toml.io/en/) file
//! (`magpie.toml` in the working directory by default) or from the
//! `MAGPIE_CONFIG_TOML` environment variable, whose content is the same as
//! the file. The env var has priority over the file. Individual options can
//! be overridden with `MAGPIE_CONFIG_OVERRIDE_`-prefixed env vars, using `__`
//! as the path separator for nested values, for example:
//!
//! ```text
//! MAGPIE_CONFIG_OVERRIDE_CRAWLER__MAX_NEIGHBORS=2000
//! ```
//!
//! When neither the file nor the env var is present the default configuration
//! is used.
//!
//! Each section of the toml maps to a data structure:
//!
//! - `[logging]` → [`Logging`]
//! - `[crawler]` → [`Crawler`] (the DHT indexing side)
//! - `[leech]` → [`Leech`] (the TCP metadata-fetching side)
use std::net::SocketAddr;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The whole configuration in toml format. It has priority over the config file.
pub const ENV_VAR_CONFIG_TOML: &str = "MAGPIE_CONFIG_TOML";

/// The configuration file location.
pub const ENV_VAR_CONFIG_TOML_PATH: &str = "MAGPIE_CONFIG_TOML_PATH";

/// The default configuration file location.
pub const DEFAULT_CONFIG_TOML_PATH: &str = "./magpie.toml";

/// Prefix for env vars that overwrite individual configuration options.
const CONFIG_OVERRIDE_PREFIX: &str = "MAGPIE_CONFIG_OVERRIDE_";
/// Path separator in env var names for nested values in configuration.
const CONFIG_OVERRIDE_SEPARATOR: &str = "__";

/// Errors that can arise loading the configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad configuration: {source}")]
    Extraction {
        #[from]
        source: figment::Error,
    },
}

/// Information required to locate the configuration.
#[derive(Debug, Default, Clone)]
pub struct Info {
    /// The whole configuration in toml, when injected via env var.
    pub config_toml: Option<String>,
    /// The configuration file path.
    pub config_toml_path: String,
}

impl Info {
    /// Builds the location info from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            config_toml: std::env::var(ENV_VAR_CONFIG_TOML).ok(),
            config_toml_path: std::env::var(ENV_VAR_CONFIG_TOML_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_TOML_PATH.to_owned()),
        }
    }
}

/// Core configuration for the crawler.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Default, Clone)]
pub struct Configuration {
    /// Logging configuration.
    pub logging: Logging,

    /// Configuration for the DHT indexing side.
    pub crawler: Crawler,

    /// Configuration for the TCP metadata-fetching side.
    pub leech: Leech,
}

/// Logging configuration.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Logging {
    /// Maximum verbosity: `off`, `error`, `warn`, `info`, `debug` or `trace`.
    pub threshold: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            threshold: String::from("info"),
        }
    }
}

/// Configuration for the DHT indexing side.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Crawler {
    /// The UDP addresses the indexers bind to. One indexing service is
    /// started per address. Only IPv4 addresses are accepted; port `0` asks
    /// the OS for a random port.
    pub indexer_addrs: Vec<SocketAddr>,

    /// Well-known DHT nodes used to seed the neighbour table when it is
    /// empty.
    pub bootstrap_nodes: Vec<String>,

    /// Seconds between two rounds of neighbour probing.
    pub interval_secs: u64,

    /// Hard upper bound on the neighbour table size.
    pub max_neighbors: usize,

    /// Egress budget, in packets per second, for each indexer socket.
    pub rate_limit: usize,
}

impl Default for Crawler {
    fn default() -> Self {
        Self {
            indexer_addrs: vec!["0.0.0.0:0".parse().expect("hardcoded address should parse")],
            bootstrap_nodes: vec![
                String::from("router.bittorrent.com:6881"),
                String::from("router.utorrent.com:6881"),
                String::from("dht.transmissionbt.com:6881"),
                String::from("dht.libtorrent.org:25401"),
            ],
            interval_secs: 2,
            max_neighbors: 500,
            rate_limit: 100,
        }
    }
}

impl Crawler {
    /// The neighbour probing period as a `Duration`.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Configuration for the TCP metadata-fetching side.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Leech {
    /// Maximum number of infohashes with an in-flight fetch at any moment.
    pub max_leeches: usize,

    /// Maximum number of fetcher tasks running concurrently.
    pub max_concurrent_downloads: usize,

    /// Seconds a single fetch session may live, from dial to parsed metadata.
    pub drain_timeout_secs: u64,
}

impl Default for Leech {
    fn default() -> Self {
        Self {
            max_leeches: 1000,
            max_concurrent_downloads: 100,
            drain_timeout_secs: 5,
        }
    }
}

impl Leech {
    /// The per-session deadline as a `Duration`.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Configuration {
    /// Loads the configuration from the locations described by `info`,
    /// applying env var overrides on top.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the toml cannot be parsed or a value has the
    /// wrong shape.
    pub fn load(info: &Info) -> Result<Configuration, Error> {
        let figment = if let Some(config_toml) = &info.config_toml {
            // Config in env var has priority over the config file path.
            Figment::from(Serialized::defaults(Configuration::default()))
                .merge(Toml::string(config_toml))
                .merge(Env::prefixed(CONFIG_OVERRIDE_PREFIX).split(CONFIG_OVERRIDE_SEPARATOR))
        } else {
            Figment::from(Serialized::defaults(Configuration::default()))
                .merge(Toml::file(&info.config_toml_path))
                .merge(Env::prefixed(CONFIG_OVERRIDE_PREFIX).split(CONFIG_OVERRIDE_SEPARATOR))
        };

        let config: Configuration = figment.extract()?;

        Ok(config)
    }

    /// Encodes the configuration to TOML.
    ///
    /// # Panics
    ///
    /// Will panic if the configuration cannot be encoded (all the field types
    /// used here can).
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string(self).expect("the configuration should encode to TOML")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{Configuration, Info};

    #[test]
    fn it_should_use_the_defaults_without_a_file_or_env_var() {
        figment::Jail::expect_with(|_jail| {
            let configuration = Configuration::load(&Info {
                config_toml: None,
                config_toml_path: "./missing.toml".to_owned(),
            })
            .expect("the default configuration should load");

            assert_eq!(configuration, Configuration::default());

            Ok(())
        });
    }

    #[test]
    fn it_should_load_from_an_inline_toml_document() {
        figment::Jail::expect_with(|_jail| {
            let toml = r#"
                [crawler]
                max_neighbors = 3
                rate_limit = 7

                [leech]
                drain_timeout_secs = 9
            "#;

            let configuration = Configuration::load(&Info {
                config_toml: Some(toml.to_owned()),
                config_toml_path: String::new(),
            })
            .expect("the inline configuration should load");

            assert_eq!(configuration.crawler.max_neighbors, 3);
            assert_eq!(configuration.crawler.rate_limit, 7);
            assert_eq!(configuration.leech.drain_timeout(), Duration::from_secs(9));
            // untouched sections keep their defaults
            assert_eq!(configuration.leech.max_leeches, 1000);

            Ok(())
        });
    }

    #[test]
    fn it_should_allow_overriding_single_options_with_env_vars() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MAGPIE_CONFIG_OVERRIDE_CRAWLER__MAX_NEIGHBORS", "42");

            let configuration = Configuration::load(&Info {
                config_toml: None,
                config_toml_path: "./missing.toml".to_owned(),
            })
            .expect("the overridden configuration should load");

            assert_eq!(configuration.crawler.max_neighbors, 42);

            Ok(())
        });
    }

    #[test]
    fn it_should_round_trip_through_toml() {
        let configuration = Configuration::default();

        let reloaded = Configuration::load(&Info {
            config_toml: Some(configuration.to_toml()),
            config_toml_path: String::new(),
        })
        .expect("the encoded configuration should load back");

        assert_eq!(reloaded, configuration);
    }

    #[test]
    fn the_default_probe_interval_should_be_two_seconds() {
        assert_eq!(Configuration::default().crawler.interval(), Duration::from_secs(2));
    }
}
