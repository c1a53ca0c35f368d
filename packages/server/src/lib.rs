// MediaMonitor - API Core
//
// Runs the two-stage media analysis pipeline (collection, then report) as
// background jobs and serves their status and reports over HTTP.

pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
