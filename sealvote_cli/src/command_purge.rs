use crate::{CliError, Config};
use sealvote::{FsBlobStore, RetentionPolicy};

pub fn command_purge(config: &Config) -> Result<(), CliError> {
    let policy = RetentionPolicy {
        enabled: config.cleanup_enabled,
        ..RetentionPolicy::days(config.retention_days)
    };

    let store = FsBlobStore::new(&config.storage_path)?;
    let purged = policy.sweep(&store)?;

    println!("{}", purged);
    Ok(())
}
