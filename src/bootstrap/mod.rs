//! Startup: configuration and logging initialisation, plus the job
//! starters that bring up each half of the crawler.
pub mod app;
pub mod config;
pub mod jobs;
pub mod logging;
