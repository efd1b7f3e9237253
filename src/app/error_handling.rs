//! Error handling utilities

use tracing::error;

/// Handle a fatal error and exit with the appropriate status code.
///
/// Exit codes: 1 for user-visible failures, 2 for invalid arguments
/// (clap produces its own 2 before we get here; this covers engine-level
/// `BadInput`). One single-line message goes to stderr; the chain is only
/// shown in verbose mode.
pub fn handle_fatal_error(err: anyhow::Error, verbose: u8) -> ! {
    use crate::error::Error;

    error!("fatal: {err}");
    eprintln!("error: {err}");

    if verbose >= 1 {
        for (i, cause) in err.chain().skip(1).enumerate() {
            eprintln!("  caused by ({i}): {cause}");
        }
    }

    let code = match err.downcast_ref::<Error>() {
        Some(Error::BadInput(_)) => 2,
        _ => 1,
    };
    std::process::exit(code);
}
