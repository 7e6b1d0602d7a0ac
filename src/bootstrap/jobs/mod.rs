//! The independent jobs the application is made of.
//!
//! There is no central run loop: startup spawns a handful of long-lived
//! tasks and the main task just waits for the shutdown signal. Each job
//! starter here brings up one of them:
//!
//! - [`dht_crawler`]: the indexing services on their UDP sockets.
//! - [`leech_pipe`]: discoveries → seen-set filter → leech sink.
//! - [`persister`]: drained metadata → storage and notification.
pub mod dht_crawler;
pub mod leech_pipe;
pub mod persister;
