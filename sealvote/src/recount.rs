use crate::*;
use chrono::{DateTime, Utc};
use rsa::RsaPrivateKey;
use zeroize::Zeroizing;

/// Why a blob was left out of the authoritative tally
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AnomalyKind {
    /// The envelope did not authenticate under the master key
    AuthenticationFailure,

    /// The blob does not match what the ledger recorded, or cannot be tied to it
    IntegrityFailure,

    /// The envelope opened but its contents are not a vote
    MalformedPayload,

    /// A sealed choice did not decrypt under the election private key
    DecryptionFailure,

    /// The choice names an option the election does not have
    InvalidOption,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub blob_id: BlobId,
    pub kind: AnomalyKind,
    pub detail: String,
}

impl Anomaly {
    fn new<S: Into<String>>(blob_id: &BlobId, kind: AnomalyKind, detail: S) -> Self {
        Anomaly {
            blob_id: blob_id.clone(),
            kind,
            detail: detail.into(),
        }
    }
}

/// Outcome of a recount
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecountReport {
    pub election_id: ElectionId,
    pub tally: Tally,
    pub total_votes: u64,
    pub blobs_examined: usize,

    /// Counted blobs whose commitment could not be checked against the ledger
    #[serde(default)]
    pub unverified: usize,
    pub anomalies: Vec<Anomaly>,
    pub discrepancies: Vec<Discrepancy>,
    pub trust: TrustLevel,
    pub completed_at: DateTime<Utc>,
}

impl RecountReport {
    pub fn anomalies_of(&self, kind: AnomalyKind) -> impl Iterator<Item = &Anomaly> {
        self.anomalies.iter().filter(move |a| a.kind == kind)
    }

    pub fn integrity_failures(&self) -> usize {
        self.anomalies_of(AnomalyKind::IntegrityFailure).count()
    }

    pub fn authentication_failures(&self) -> usize {
        self.anomalies_of(AnomalyKind::AuthenticationFailure).count()
    }

    /// Every blob was counted and checked against the ledger
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty() && self.trust == TrustLevel::Verified
    }
}

/// One envelope opened for audit
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobInspection {
    pub blob_id: BlobId,
    pub commitment: Commitment,
    pub payload: VotePayload,

    /// The option voted for. `None` for a sealed choice inspected without the private key.
    pub option_id: Option<String>,
}

/// Closes an election by decrypting, verifying and counting every stored ballot.
///
/// Only the blobs themselves and the ledger are trusted. The advisory tally is read solely to
/// report where it went wrong.
pub struct RecountEngine {
    services: Services,
}

impl RecountEngine {
    pub fn new(services: Services) -> Self {
        RecountEngine { services }
    }

    pub fn recount(
        &self,
        election_id: &ElectionId,
        private_key_pem: &str,
    ) -> Result<RecountReport, Error> {
        let private = keygen::decode_private(private_key_pem)?;

        let election = self.services.elections.get(election_id)?;
        let public = keygen::decode_public(&election.public_key)?;
        if !keygen::matches(&private, &public) {
            return Err(Error::KeyMismatch(election_id.clone()));
        }

        let election = self.services.freeze(election_id)?;
        info!("recount of election {} started, submissions frozen", election_id);

        if let Err(e) = self.services.ledger.close_election(election_id) {
            warn!("could not close election {} on the ledger: {}", election_id, e);
        }

        let ledger_reachable = self.services.ledger.is_reachable();
        if !ledger_reachable {
            warn!(
                "ledger unreachable, recount of {} proceeds without commitment checks",
                election_id
            );
        }

        let blob_ids = self.services.blobs.list(election_id)?;
        let mut tally = empty_tally(&election);
        let mut anomalies = vec![];
        let mut unverified = 0;

        for blob_id in blob_ids.iter() {
            match self.examine(blob_id, &election, &private, ledger_reachable) {
                Ok((option_id, verified)) => {
                    debug!("blob {} counted", blob_id);
                    if !verified {
                        unverified += 1;
                    }
                    if let Some(count) = tally.get_mut(&option_id) {
                        *count += 1;
                    }
                }
                Err(anomaly) => {
                    warn!(
                        "blob {} rejected ({:?}): {}",
                        blob_id, anomaly.kind, anomaly.detail
                    );
                    anomalies.push(anomaly);
                }
            }
        }

        let total_votes: u64 = tally.values().sum();
        let trust = if ledger_reachable && unverified == 0 {
            TrustLevel::Verified
        } else {
            TrustLevel::Degraded
        };

        let advisory = self
            .services
            .advisory
            .get(election_id)
            .unwrap_or_default();
        let discrepancies = discrepancies(&advisory, &tally, election.choice_mode);
        for discrepancy in discrepancies.iter() {
            warn!(
                "election {} discrepancy, {}",
                election_id, discrepancy
            );
        }

        let mut closed = election.clone();
        closed.total_votes = total_votes;
        closed.transition(ElectionStatus::Closed)?;
        let results = ElectionResults::new(&closed, &tally, trust, anomalies.len());
        self.services.elections.set_results(election_id, results)?;

        let closed_at = closed.closed_at;
        self.services.elections.update(election_id, &mut |e| {
            e.total_votes = total_votes;
            e.transition(ElectionStatus::Closed)?;
            e.closed_at = closed_at;
            Ok(())
        })?;

        info!(
            "recount of election {} finished: {} votes from {} blobs, {} anomalies, trust {:?}",
            election_id,
            total_votes,
            blob_ids.len(),
            anomalies.len(),
            trust
        );

        Ok(RecountReport {
            election_id: election_id.clone(),
            tally,
            total_votes,
            blobs_examined: blob_ids.len(),
            unverified,
            anomalies,
            discrepancies,
            trust,
            completed_at: Utc::now(),
        })
    }

    /// Open a single blob for audit without touching the election.
    ///
    /// Sealed choices are unsealed only when the election private key is supplied.
    pub fn inspect(
        &self,
        blob_id: &BlobId,
        private_key_pem: Option<&str>,
    ) -> Result<BlobInspection, Error> {
        let sealed = self.services.blobs.get(blob_id)?;
        let plaintext = Zeroizing::new(envelope::open(&sealed, &self.services.master_key)?);
        let payload: VotePayload = serde_json::from_slice(&plaintext)?;

        if payload.election_id != blob_id.election {
            return Err(Error::IntegrityFailure(format!(
                "blob {} holds a ballot for election {}",
                blob_id, payload.election_id
            )));
        }

        let option_id = match (&payload.choice, private_key_pem) {
            (BallotChoice::Plain { option_id }, _) => Some(option_id.clone()),
            (BallotChoice::Sealed { ciphertext }, Some(pem)) => {
                let private = keygen::decode_private(pem)?;
                let election = self.services.elections.get(&payload.election_id)?;
                if !keygen::matches(&private, &keygen::decode_public(&election.public_key)?) {
                    return Err(Error::KeyMismatch(election.id));
                }
                Some(keygen::unseal_choice(&private, ciphertext)?)
            }
            (BallotChoice::Sealed { .. }, None) => None,
        };

        info!("blob {} inspected", blob_id);
        Ok(BlobInspection {
            blob_id: blob_id.clone(),
            commitment: Commitment::of(&sealed),
            payload,
            option_id,
        })
    }

    // Verify one blob and return the option it counts for, and whether the ledger vouched for it
    fn examine(
        &self,
        blob_id: &BlobId,
        election: &Election,
        private: &RsaPrivateKey,
        check_ledger: bool,
    ) -> Result<(String, bool), Anomaly> {
        use AnomalyKind::*;

        let sealed = self.services.blobs.get(blob_id).map_err(|e| {
            Anomaly::new(blob_id, IntegrityFailure, format!("blob unreadable: {}", e))
        })?;

        let plaintext = Zeroizing::new(
            envelope::open(&sealed, &self.services.master_key)
                .map_err(|e| Anomaly::new(blob_id, AuthenticationFailure, e.to_string()))?,
        );

        let reference = self
            .services
            .index
            .reference_for(blob_id)
            .map_err(|e| Anomaly::new(blob_id, IntegrityFailure, e.to_string()))?
            .ok_or_else(|| Anomaly::new(blob_id, IntegrityFailure, "no ledger reference"))?;

        let verified = if check_ledger {
            let commitment = Commitment::of(&sealed);
            match self.services.ledger.query_commitment(&reference) {
                Ok(Some(recorded)) if recorded == commitment => true,
                Ok(Some(recorded)) => {
                    return Err(Anomaly::new(
                        blob_id,
                        IntegrityFailure,
                        format!(
                            "commitment {} does not match ledger record {} under {}",
                            commitment, recorded, reference
                        ),
                    ))
                }
                Ok(None) => {
                    return Err(Anomaly::new(
                        blob_id,
                        IntegrityFailure,
                        format!("ledger has no record {}", reference),
                    ))
                }
                Err(e) if e.is_ledger_unavailable() => {
                    warn!(
                        "ledger unavailable while checking blob {} of {}, counted unverified: {}",
                        blob_id, election.id, e
                    );
                    false
                }
                Err(e) => return Err(Anomaly::new(blob_id, IntegrityFailure, e.to_string())),
            }
        } else {
            false
        };

        let payload: VotePayload = serde_json::from_slice(&plaintext)
            .map_err(|e| Anomaly::new(blob_id, MalformedPayload, e.to_string()))?;

        if payload.election_id != election.id {
            return Err(Anomaly::new(
                blob_id,
                IntegrityFailure,
                format!("payload belongs to election {}", payload.election_id),
            ));
        }

        let option_id = match (election.choice_mode, payload.choice) {
            (ChoiceMode::Plain, BallotChoice::Plain { option_id }) => option_id,
            (ChoiceMode::Sealed, BallotChoice::Sealed { ciphertext }) => {
                keygen::unseal_choice(private, &ciphertext)
                    .map_err(|e| Anomaly::new(blob_id, DecryptionFailure, e.to_string()))?
            }
            (mode, _) => {
                return Err(Anomaly::new(
                    blob_id,
                    MalformedPayload,
                    format!("choice does not match {} election", mode),
                ))
            }
        };

        if election.get_option(&option_id).is_none() {
            return Err(Anomaly::new(
                blob_id,
                InvalidOption,
                "choice names an undeclared option",
            ));
        }

        Ok((option_id, verified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    struct Fixture {
        coordinator: VoteSubmissionCoordinator,
        recount: RecountEngine,
        blobs: Arc<MemBlobStore>,
        index: Arc<MemVoteIndex>,
    }

    fn fixture() -> Fixture {
        let blobs = Arc::new(MemBlobStore::new());
        let index = Arc::new(MemVoteIndex::new());
        let services = Services::new(
            Arc::new(MemElectionStore::new()),
            index.clone(),
            blobs.clone(),
            Arc::new(MemLedger::new()),
            Arc::new(AdvisoryTally::new()),
            Arc::new(MasterKey::generate()),
        );
        Fixture {
            coordinator: VoteSubmissionCoordinator::new(services.clone()),
            recount: RecountEngine::new(services),
            blobs,
            index,
        }
    }

    fn open_election(f: &Fixture, id: &str) -> (Election, Zeroizing<String>) {
        let now = Utc::now();
        let new = NewElection {
            id: ElectionId::new(id).unwrap(),
            title: "Recount test".into(),
            description: String::new(),
            options: vec![ElectionOption::new("a", "A", 0), ElectionOption::new("b", "B", 1)],
            start_time: now - Duration::minutes(1),
            end_time: now + Duration::hours(1),
            choice_mode: ChoiceMode::Plain,
            created_by: "admin".into(),
        };
        let (election, key) = f.coordinator.create_election(new).unwrap();
        let election = f.coordinator.open_election(&election.id).unwrap();
        (election, key.into_pem())
    }

    #[test]
    fn test_wrong_election_payload() {
        let f = fixture();
        let (first, first_key) = open_election(&f, "first");
        let (second, _) = open_election(&f, "second");

        f.coordinator
            .submit(&first.id, "u1", BallotChoice::plain("a"), None)
            .unwrap();

        // A valid envelope from another election copied into this one
        let receipt = f
            .coordinator
            .submit(&second.id, "u1", BallotChoice::plain("b"), None)
            .unwrap();
        let copied = f.blobs.get(&receipt.blob_id).unwrap();
        let planted = f.blobs.put(&first.id, &copied).unwrap();
        f.index
            .record_reference(&planted, receipt.reference_id.clone())
            .unwrap();

        let report = f.recount.recount(&first.id, &first_key).unwrap();
        assert_eq!(report.total_votes, 1);
        assert_eq!(report.tally["a"], 1);
        assert_eq!(report.integrity_failures(), 1);
        assert_eq!(report.anomalies[0].blob_id, planted);
    }

    #[test]
    fn test_unreferenced_blob() {
        let f = fixture();
        let (election, key) = open_election(&f, "orphan");

        let receipt = f
            .coordinator
            .submit(&election.id, "u1", BallotChoice::plain("b"), None)
            .unwrap();
        f.index.remove_reference(&receipt.blob_id).unwrap();

        let report = f.recount.recount(&election.id, &key).unwrap();
        assert_eq!(report.total_votes, 0);
        assert_eq!(report.integrity_failures(), 1);
        assert!(!report.is_clean());

        // The advisory tally saw a vote the recount could not confirm
        assert!(report
            .discrepancies
            .iter()
            .any(|d| d.option_id.as_deref() == Some("b") && d.advisory == 1 && d.authoritative == 0));
    }

    #[test]
    fn test_recount_requires_active_election() {
        let f = fixture();
        let (election, key) = open_election(&f, "twice");

        f.recount.recount(&election.id, &key).unwrap();
        assert!(matches!(
            f.recount.recount(&election.id, &key),
            Err(Error::InvalidTransition {
                from: ElectionStatus::Closed,
                ..
            })
        ));

        let missing = ElectionId::new("missing").unwrap();
        assert!(matches!(
            f.recount.recount(&missing, &key),
            Err(Error::ElectionNotFound(_))
        ));
    }
}
