use crate::{CliError, Config};
use sealvote::*;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

/// Everything a command needs that outlives a single invocation
#[derive(Serialize, Deserialize, Default)]
pub struct State {
    #[serde(default)]
    pub elections: ElectionSnapshot,

    #[serde(default)]
    pub votes: VoteIndexSnapshot,

    #[serde(default)]
    pub advisory: BTreeMap<ElectionId, AdvisorySnapshot>,
}

/// A coordinator and recount engine wired to on-disk state.
///
/// Holds an exclusive lock on the state for as long as it lives, so concurrent invocations run
/// one after another.
pub struct Node {
    pub coordinator: VoteSubmissionCoordinator,
    pub recount: RecountEngine,
    elections: Arc<MemElectionStore>,
    index: Arc<MemVoteIndex>,
    advisory: Arc<AdvisoryTally>,
    journal: Option<Arc<MemLedger>>,
    state_path: String,
    journal_path: String,
    _lock: File,
}

impl Node {
    pub fn open(config: &Config) -> Result<Self, CliError> {
        let lock = lock_state(&config.state_path)?;
        let master_key = Keystore::load(&config.keystore_path)?;
        let state: State = read_json(&config.state_path)?.unwrap_or_default();

        let elections = Arc::new(MemElectionStore::from_snapshot(state.elections));
        let index = Arc::new(MemVoteIndex::from_snapshot(state.votes));
        let advisory = Arc::new(AdvisoryTally::from_snapshot(state.advisory));
        let blobs = Arc::new(FsBlobStore::new(&config.storage_path)?);

        let retry = RetryPolicy {
            max_attempts: config.ledger_max_attempts,
            initial_backoff: config.ledger_backoff,
            ..RetryPolicy::default()
        };

        let mut journal = None;
        let ledger: Arc<dyn CommitmentLedgerClient> = match &config.ledger_url {
            Some(url) => {
                debug!("using ledger gateway at {}", url);
                Arc::new(HttpLedger::new(url, config.ledger_timeout, retry)?)
            }
            None => {
                debug!("using local ledger journal {}", config.ledger_journal);
                let snapshot: LedgerJournal =
                    read_json(&config.ledger_journal)?.unwrap_or_default();
                let mem = Arc::new(MemLedger::from_journal(snapshot).with_retry(retry));
                journal = Some(mem.clone());
                mem
            }
        };

        let services = Services::new(
            elections.clone(),
            index.clone(),
            blobs,
            ledger,
            advisory.clone(),
            Arc::new(master_key),
        );

        Ok(Node {
            coordinator: VoteSubmissionCoordinator::new(services.clone()),
            recount: RecountEngine::new(services),
            elections,
            index,
            advisory,
            journal,
            state_path: config.state_path.clone(),
            journal_path: config.ledger_journal.clone(),
            _lock: lock,
        })
    }

    /// Persist state, and the local ledger journal when there is one
    pub fn save(&self) -> Result<(), CliError> {
        let state = State {
            elections: self.elections.snapshot(),
            votes: self.index.snapshot(),
            advisory: self.advisory.snapshot(),
        };
        write_json(&self.state_path, &state)?;

        if let Some(journal) = &self.journal {
            write_json(&self.journal_path, &journal.snapshot())?;
        }
        Ok(())
    }
}

// Blocks until no other node holds the state
fn lock_state(state_path: &str) -> Result<File, CliError> {
    let path = format!("{}.lock", state_path);
    create_parent(&path)?;

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(|e| CliError::file(&path, e))?;

    if file.try_lock_exclusive().is_err() {
        info!("waiting for another sealvote process to release {}", path);
        file.lock_exclusive().map_err(|e| CliError::file(&path, e))?;
    }
    Ok(file)
}

fn create_parent(path: &str) -> Result<(), CliError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| CliError::file(path, e))?;
        }
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<Option<T>, CliError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CliError::file(path, e)),
    };

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| CliError::State {
            path: path.to_owned(),
            source,
        })
}

// Written beside the target then renamed, so a crash never leaves half a file.
fn write_json<T: Serialize>(path: &str, value: &T) -> Result<(), CliError> {
    let contents = serde_json::to_vec_pretty(value)?;

    create_parent(path)?;

    let tmp = format!("{}.tmp", path);
    fs::write(&tmp, contents).map_err(|e| CliError::file(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CliError::file(path, e))?;
    Ok(())
}
