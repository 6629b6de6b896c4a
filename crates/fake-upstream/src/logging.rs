//! Opt-in log output for test runs.
//!
//! The crate emits `tracing` events at every state change (listener start,
//! accept, claim, disconnect, stream events). Nothing is printed unless a
//! subscriber is installed; [`init`] installs one when `FAKE_UPSTREAM_LOG`
//! is set.
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `FAKE_UPSTREAM_LOG=debug` | Filter directive, e.g. `debug` or `fake_upstream=trace` |
//! | `FAKE_UPSTREAM_LOG=1` | Shorthand for `fake_upstream=debug` |
//! | Unset | No subscriber is installed |

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

/// Environment variable read by [`init`].
pub const LOG_ENV: &str = "FAKE_UPSTREAM_LOG";

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install a test-writer `fmt` subscriber if `FAKE_UPSTREAM_LOG` is set.
///
/// Safe to call from every test; only the first call has an effect, and an
/// already installed global subscriber is left in place.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let Ok(directives) = env::var(LOG_ENV) else {
        return;
    };
    let filter = filter_for(&directives);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}

/// Returns true once [`init`] has run.
#[must_use]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

fn filter_for(directives: &str) -> EnvFilter {
    match directives.trim() {
        "1" | "true" => EnvFilter::new("fake_upstream=debug"),
        other => {
            EnvFilter::try_new(other).unwrap_or_else(|_| EnvFilter::new("fake_upstream=debug"))
        }
    }
}
