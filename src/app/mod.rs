//! Application module
//!
//! Application-level plumbing: state-directory resolution, engine settings,
//! logging setup, and fatal error handling.

pub mod config;
pub mod error_handling;
pub mod logging;

pub use config::{AppConfig, GatewaySettings, MedicSettings, Settings};
pub use error_handling::handle_fatal_error;
pub use logging::init_logging;
