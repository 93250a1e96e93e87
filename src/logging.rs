//! Logging initialization.
//!
//! Both binaries reserve stdout for their JSON result, so every profile
//! writes to stderr.

use std::sync::Once;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

/// Logging profile configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Human-readable output for development
    Development,
    /// JSON structured output for production
    Production,
    /// No output; for tests
    Test,
}

impl Profile {
    /// Pick a profile from a `BOOKING_LOG_FORMAT` value.
    pub fn from_format(format: Option<&str>) -> Self {
        match format.map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("json") => Profile::Production,
            _ => Profile::Development,
        }
    }
}

const DEFAULT_FILTER: &str = "booking_rgi=info,booking=info,send_mail=info";

static INIT_ONCE: Once = Once::new();

/// Initialize the tracing subscriber. Later calls are no-ops.
///
/// `RUST_LOG` overrides the default filter.
pub fn init(profile: Profile) {
    INIT_ONCE.call_once(|| match profile {
        Profile::Development => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter())
                .init();
        }
        Profile::Production => {
            tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(filter())
                .init();
        }
        Profile::Test => {
            tracing_subscriber::registry().init();
        }
    });
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
