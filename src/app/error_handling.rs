//! Error handling utilities

use tracing::error;

/// Report a fatal error and exit.
///
/// Errors from this crate map to their own exit codes; anything else exits
/// with 1. With `verbose >= 1` the full cause chain is printed.
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {}", error);
    eprintln!("Error: {error}");

    if verbose >= 1 {
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
    }

    std::process::exit(exit_code(&error))
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<crate::error::Error>() {
        Some(err) => err.exit_code(),
        None => 1,
    }
}
