//! filehandlers - one async contract over FTP, SFTP and Google Drive
//!
//! Obtain a handler from [`HandlerFactory`], load its settings once, then
//! use the [`FileHandler`] operations regardless of the backend behind it.

pub mod config;
pub mod handlers;

pub use handlers::{
    ConnectionStatus, FileHandler, FileHandlerInfo, FileInfo, HandlerError, HandlerFactory,
    HandlerSettings, HandlerType, ListResult, PageToken,
};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber, writing to stderr
///
/// `RUST_LOG` takes precedence; otherwise `info`, or `debug` when verbose.
/// Calling it twice is harmless.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
