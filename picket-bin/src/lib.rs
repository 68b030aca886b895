//! # Picket evaluation binaries
//!
//! Exercises the picket detector end to end: violation scenarios against
//! real guarded pages (with a `SIGSEGV` handler routing traps back into the
//! detector), soak runs against the sampling gate, and JSON result capture.
//!
//! ## Quickstart
//!
//! ```sh
//! cargo build --release
//! cargo run --release --bin=eval_detect -- --scenario all
//! ```
//!
//! After a successful compilation the binary is located at
//! `target/release/eval_detect`. Use `target/release/eval_detect --help` to
//! see available scenarios and options. `--mapper sim` swaps the anonymous
//! mapping for the simulated byte-array mapper; scenarios that need real
//! page protection are skipped there.

use indicatif::{MultiProgress, ProgressStyle};
use indicatif_log_bridge::LogWrapper;

pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Extension trait for creating named progress bars.
pub trait NamedProgress {
    /// Creates a progress bar style with a name label.
    ///
    /// # Arguments
    ///
    /// * `name` - Label to display with the progress bar
    fn named_bar(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let template = format!(
            "{name:<31} {{wide_bar:40.cyan/blue}} {{pos:>3}}/{{len:<3}} [{{elapsed_precise}} ({{eta}} remaining)] {{msg}}"
        );
        ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}
