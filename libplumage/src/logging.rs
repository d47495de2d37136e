//! Logging setup for Plumage binaries
//!
//! Everything goes to stderr through `tracing`. Output is plain text
//! unless the operator asks for JSON (for log shippers) or colored
//! text (for a dev terminal). A full `RUST_LOG` directive, when set,
//! overrides the configured level.

use tracing_subscriber::EnvFilter;

/// Rendering choices for the global subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Emit one JSON object per line instead of human-readable text
    pub json: bool,
    /// Color the text output (ignored when `json` is set)
    pub ansi: bool,
    /// Filter directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl LogOptions {
    /// Resolve options from the operator's format and level choices.
    /// A `verbose` CLI flag beats the configured level.
    ///
    /// Formats: `json`, `pretty` (colored text), anything else is
    /// plain text. An unset or empty level means `info`.
    pub fn resolve(format: &str, level: &str, verbose: bool) -> Self {
        let filter = if verbose {
            "debug".to_string()
        } else if level.is_empty() {
            "info".to_string()
        } else {
            level.to_string()
        };

        Self {
            json: format.eq_ignore_ascii_case("json"),
            ansi: format.eq_ignore_ascii_case("pretty"),
            filter,
        }
    }

    /// Resolve from `PLUMAGE_LOG_FORMAT` and `PLUMAGE_LOG_LEVEL`.
    pub fn from_env(verbose: bool) -> Self {
        Self::resolve(
            &std::env::var("PLUMAGE_LOG_FORMAT").unwrap_or_default(),
            &std::env::var("PLUMAGE_LOG_LEVEL").unwrap_or_default(),
            verbose,
        )
    }

    /// Install the global subscriber.
    ///
    /// # Panics
    ///
    /// Panics if a subscriber has already been installed in this
    /// process.
    pub fn install(self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);

        if self.json {
            builder.json().flatten_event(true).init();
        } else {
            // Targets earn their width only on a dev terminal
            builder.with_ansi(self.ansi).with_target(self.ansi).init();
        }
    }
}
