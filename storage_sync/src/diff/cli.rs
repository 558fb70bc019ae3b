use clap::Args;

const HELP_HEADING: &str = "Diff options";

/// Tuning of the storage diff requests.
#[derive(Args, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct CliDiffConfig {
    /// Number of storage keys requested per `parity_listStorageKeys` call.
    #[arg(short, long, env = "STORAGE_SYNC_BATCH_SIZE", help_heading = HELP_HEADING, default_value_t = super::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Maximum number of value lookups and replays in flight at once.
    #[arg(long, env = "STORAGE_SYNC_MAX_CONCURRENT_LOOKUPS", help_heading = HELP_HEADING, default_value_t = super::DEFAULT_MAX_CONCURRENT_LOOKUPS)]
    max_concurrent_lookups: usize,
}

impl From<CliDiffConfig> for super::DiffConfig {
    fn from(cli: CliDiffConfig) -> Self {
        Self {
            batch_size: cli.batch_size,
            max_concurrent_lookups: cli.max_concurrent_lookups,
        }
    }
}
