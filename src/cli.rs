use crate::cluster::Granularity;
use crate::config::Config;
use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run a single reconciliation pass, print the report and exit.
    Once,
    /// Run a startup pass, then keep reconciling on schedule, liveness edges and SIGHUP.
    Service,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sensor-reconciler",
    version,
    about = "Merges duplicate sensor readings and backfills missing fields"
)]
pub struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Service)]
    pub mode: Mode,
    /// Bucket width used to detect duplicates (minute or second).
    #[arg(long)]
    pub granularity: Option<Granularity>,
    #[arg(long)]
    pub database_url: Option<String>,
    /// Number of most recent records loaded per pass.
    #[arg(long)]
    pub window: Option<usize>,
}

impl Args {
    /// Command-line flags win over env and setup-file values.
    pub fn apply(&self, config: &mut Config) {
        if let Some(granularity) = self.granularity {
            config.granularity = granularity;
        }
        if let Some(url) = self
            .database_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.database_url = url.to_string();
        }
        if let Some(window) = self.window.filter(|v| *v != 0) {
            config.window_size = window;
        }
    }
}
