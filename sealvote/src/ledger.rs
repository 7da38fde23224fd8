use crate::*;
use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// The append-only ledger that records vote commitments.
///
/// Recount trusts a blob only if the ledger holds the same commitment under the blob's reference.
pub trait CommitmentLedgerClient: Send + Sync {
    /// Record a commitment, returning the ledger's reference for it
    fn submit_commitment(
        &self,
        election: &ElectionId,
        commitment: &Commitment,
    ) -> Result<ReferenceId, Error>;

    /// Look up the commitment recorded under a reference. `None` if the ledger has no such record.
    fn query_commitment(&self, reference: &ReferenceId) -> Result<Option<Commitment>, Error>;

    fn is_reachable(&self) -> bool;

    /// Register an election and its public key with the ledger
    fn open_election(&self, election: &ElectionId, public_key_pem: &str) -> Result<(), Error>;

    /// Mark an election closed on the ledger
    fn close_election(&self, election: &ElectionId) -> Result<(), Error>;
}

/// Outcome of a single failed ledger call
#[derive(Debug)]
pub enum CallError {
    /// Worth another attempt: timeouts, refused connections, 5xx
    Transient(String),

    /// Retrying will not help
    Fatal(Error),
}

impl From<Error> for CallError {
    fn from(e: Error) -> Self {
        CallError::Fatal(e)
    }
}

/// Bounded exponential backoff for ledger calls
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn once() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(0),
            max_backoff: Duration::from_millis(0),
        }
    }

    /// Run `call` until it succeeds, fails fatally, or runs out of attempts.
    pub fn run<T, F>(&self, operation: &'static str, mut call: F) -> Result<T, Error>
    where
        F: FnMut() -> Result<T, CallError>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = std::cmp::min(self.initial_backoff, self.max_backoff);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match call() {
                Ok(value) => return Ok(value),
                Err(CallError::Fatal(e)) => return Err(e),
                Err(CallError::Transient(reason)) if attempt >= max_attempts => {
                    error!(
                        "ledger {} failed after {} attempt(s): {}",
                        operation, attempt, reason
                    );
                    return Err(Error::LedgerUnavailable {
                        operation,
                        attempts: attempt,
                        reason,
                    });
                }
                Err(CallError::Transient(reason)) => {
                    warn!(
                        "ledger {} attempt {}/{} failed, retrying in {:?}: {}",
                        operation, attempt, max_attempts, backoff, reason
                    );
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerElection {
    pub public_key: String,
    pub closed: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    pub election_id: ElectionId,
    pub commitment: Commitment,
}

/// Full contents of an in-memory ledger
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LedgerJournal {
    pub elections: BTreeMap<ElectionId, LedgerElection>,
    pub records: BTreeMap<ReferenceId, LedgerRecord>,
}

/// In-memory ledger.
///
/// Besides standing in for a real ledger, it can be told to become unreachable, to fail the
/// next few calls, or to have a record rewritten.
pub struct MemLedger {
    journal: Mutex<LedgerJournal>,
    reachable: AtomicBool,
    pending_failures: AtomicU32,
    retry: RetryPolicy,
}

impl Default for MemLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLedger {
    pub fn new() -> Self {
        Self::from_journal(LedgerJournal::default())
    }

    pub fn from_journal(journal: LedgerJournal) -> Self {
        MemLedger {
            journal: Mutex::new(journal),
            reachable: AtomicBool::new(true),
            pending_failures: AtomicU32::new(0),
            retry: RetryPolicy::once(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn snapshot(&self) -> LedgerJournal {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn restore(&self, journal: LedgerJournal) {
        *self.journal.lock().unwrap_or_else(PoisonError::into_inner) = journal;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail with a transient error
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Rewrite the commitment recorded under a reference
    pub fn tamper(&self, reference: &ReferenceId, commitment: Commitment) -> Result<(), Error> {
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        let record = journal
            .records
            .get_mut(reference)
            .ok_or_else(|| Error::ReferenceNotFound(reference.clone()))?;
        record.commitment = commitment;
        Ok(())
    }

    /// Drop a record entirely
    pub fn forget(&self, reference: &ReferenceId) -> bool {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .remove(reference)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self, election: &ElectionId) -> bool {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elections
            .get(election)
            .map(|e| e.closed)
            .unwrap_or(false)
    }

    // Every call goes through here so reachability and injected failures apply uniformly.
    fn call<T, F>(&self, operation: &'static str, mut op: F) -> Result<T, Error>
    where
        F: FnMut(&mut LedgerJournal) -> Result<T, Error>,
    {
        self.retry.run(operation, || {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(CallError::Transient("ledger unreachable".into()));
            }

            let injected = self
                .pending_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(CallError::Transient("injected failure".into()));
            }

            let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut journal).map_err(CallError::Fatal)
        })
    }
}

impl CommitmentLedgerClient for MemLedger {
    fn submit_commitment(
        &self,
        election: &ElectionId,
        commitment: &Commitment,
    ) -> Result<ReferenceId, Error> {
        self.call("submit_commitment", |journal| {
            if journal.elections.get(election).map(|e| e.closed) == Some(true) {
                return Err(Error::LedgerRejected {
                    operation: "submit_commitment",
                    reason: format!("election {} is closed", election),
                });
            }

            let reference = ReferenceId::new(format!("tx-{}", Uuid::new_v4().simple()));
            journal.records.insert(
                reference.clone(),
                LedgerRecord {
                    election_id: election.clone(),
                    commitment: *commitment,
                },
            );
            Ok(reference)
        })
    }

    fn query_commitment(&self, reference: &ReferenceId) -> Result<Option<Commitment>, Error> {
        self.call("query_commitment", |journal| {
            Ok(journal.records.get(reference).map(|r| r.commitment))
        })
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn open_election(&self, election: &ElectionId, public_key_pem: &str) -> Result<(), Error> {
        self.call("open_election", |journal| {
            journal.elections.insert(
                election.clone(),
                LedgerElection {
                    public_key: public_key_pem.to_string(),
                    closed: false,
                },
            );
            Ok(())
        })
    }

    fn close_election(&self, election: &ElectionId) -> Result<(), Error> {
        self.call("close_election", |journal| {
            let entry = journal
                .elections
                .entry(election.clone())
                .or_insert_with(|| LedgerElection {
                    public_key: String::new(),
                    closed: false,
                });
            entry.closed = true;
            Ok(())
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenElectionRequest<'a> {
    election_id: &'a ElectionId,
    public_key: &'a str,
}

#[derive(Serialize, Deserialize)]
struct CommitmentBody {
    commitment: Commitment,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    reference_id: ReferenceId,
}

/// Ledger reached over its REST gateway.
///
/// ```text
/// POST {base}/elections                       {electionId, publicKey}
/// POST {base}/elections/{id}/close
/// POST {base}/elections/{id}/commitments      {commitment} -> {referenceId}
/// GET  {base}/commitments/{ref}               -> {commitment} | 404
/// GET  {base}/health
/// ```
pub struct HttpLedger {
    base: Url,
    client: Client,
    retry: RetryPolicy,
}

impl HttpLedger {
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self, Error> {
        let base = Url::parse(base_url).map_err(|e| Error::LedgerRejected {
            operation: "configure",
            reason: format!("invalid ledger url {}: {}", base_url, e),
        })?;

        if base.cannot_be_a_base() {
            return Err(Error::LedgerRejected {
                operation: "configure",
                reason: format!("invalid ledger url {}", base_url),
            });
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::LedgerRejected {
                operation: "configure",
                reason: e.to_string(),
            })?;

        Ok(HttpLedger {
            base,
            client,
            retry,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    // Map a response or transport error onto the retry classification
    fn check(
        operation: &'static str,
        result: reqwest::Result<Response>,
    ) -> Result<Response, CallError> {
        let response = result.map_err(|e| CallError::Transient(e.to_string()))?;
        let status = response.status();

        if status.is_server_error() {
            return Err(CallError::Transient(format!("ledger returned {}", status)));
        }

        if status.is_client_error() && status != StatusCode::NOT_FOUND {
            let body = response.text().unwrap_or_default();
            return Err(CallError::Fatal(Error::LedgerRejected {
                operation,
                reason: format!("{} {}", status, body),
            }));
        }

        Ok(response)
    }

    fn not_found(operation: &'static str, what: String) -> CallError {
        CallError::Fatal(Error::LedgerRejected {
            operation,
            reason: format!("{} not found", what),
        })
    }

    fn malformed(operation: &'static str, e: reqwest::Error) -> CallError {
        CallError::Fatal(Error::LedgerRejected {
            operation,
            reason: format!("malformed response: {}", e),
        })
    }
}

impl CommitmentLedgerClient for HttpLedger {
    fn submit_commitment(
        &self,
        election: &ElectionId,
        commitment: &Commitment,
    ) -> Result<ReferenceId, Error> {
        const OP: &str = "submit_commitment";
        let url = self.url(&["elections", election.as_str(), "commitments"]);
        let body = CommitmentBody {
            commitment: *commitment,
        };

        self.retry.run(OP, || {
            let response = Self::check(OP, self.client.post(url.clone()).json(&body).send())?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(Self::not_found(OP, format!("election {}", election)));
            }
            let submitted: SubmitResponse =
                response.json().map_err(|e| Self::malformed(OP, e))?;
            Ok(submitted.reference_id)
        })
    }

    fn query_commitment(&self, reference: &ReferenceId) -> Result<Option<Commitment>, Error> {
        const OP: &str = "query_commitment";
        let url = self.url(&["commitments", reference.as_str()]);

        self.retry.run(OP, || {
            let response = Self::check(OP, self.client.get(url.clone()).send())?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let body: CommitmentBody = response.json().map_err(|e| Self::malformed(OP, e))?;
            Ok(Some(body.commitment))
        })
    }

    fn is_reachable(&self) -> bool {
        match self.client.get(self.url(&["health"])).send() {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("ledger health check failed: {}", e);
                false
            }
        }
    }

    fn open_election(&self, election: &ElectionId, public_key_pem: &str) -> Result<(), Error> {
        const OP: &str = "open_election";
        let url = self.url(&["elections"]);
        let body = OpenElectionRequest {
            election_id: election,
            public_key: public_key_pem,
        };

        self.retry.run(OP, || {
            let response = Self::check(OP, self.client.post(url.clone()).json(&body).send())?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(Self::not_found(OP, url.to_string()));
            }
            Ok(())
        })
    }

    fn close_election(&self, election: &ElectionId) -> Result<(), Error> {
        const OP: &str = "close_election";
        let url = self.url(&["elections", election.as_str(), "close"]);

        self.retry.run(OP, || {
            let response = Self::check(OP, self.client.post(url.clone()).send())?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(Self::not_found(OP, format!("election {}", election)));
            }
            Ok(())
        })
    }
}
