use crate::*;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;
use zeroize::Zeroizing;

const VERIFICATION_CODE_LENGTH: usize = 12;
const VERIFICATION_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// The voter's choice as it travels inside the envelope
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BallotChoice {
    /// Option id in the clear. Protected only by the envelope until recount.
    Plain {
        #[serde(rename = "optionId")]
        option_id: String,
    },

    /// Option id RSA-encrypted under the election public key, base64
    Sealed { ciphertext: String },
}

impl BallotChoice {
    pub fn plain<S: Into<String>>(option_id: S) -> Self {
        BallotChoice::Plain {
            option_id: option_id.into(),
        }
    }

    /// Seal an option id under the election public key
    pub fn sealed(election: &Election, option_id: &str) -> Result<Self, Error> {
        let public = ElectionPublicKey::from_pem(&election.public_key)?;
        Ok(BallotChoice::Sealed {
            ciphertext: keygen::seal_choice(public.key(), option_id)?,
        })
    }

    pub fn mode(&self) -> ChoiceMode {
        match self {
            BallotChoice::Plain { .. } => ChoiceMode::Plain,
            BallotChoice::Sealed { .. } => ChoiceMode::Sealed,
        }
    }
}

/// Plaintext of a vote envelope.
///
/// Holds no voter identity.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VotePayload {
    pub election_id: ElectionId,
    pub choice: BallotChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Proof of submission handed back to the voter
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub election_id: ElectionId,
    pub blob_id: BlobId,
    pub reference_id: ReferenceId,
    pub commitment: Commitment,
    pub processed_at: DateTime<Utc>,
    pub verification_code: String,
}

fn verification_code() -> String {
    (0..VERIFICATION_CODE_LENGTH)
        .map(|_| VERIFICATION_CODE_CHARSET[OsRng.gen_range(0..VERIFICATION_CODE_CHARSET.len())] as char)
        .collect()
}

/// Everything the coordinator and the recount engine share
#[derive(Clone)]
pub struct Services {
    pub elections: Arc<dyn ElectionStore>,
    pub index: Arc<dyn VoteIndex>,
    pub blobs: Arc<dyn BlobStore>,
    pub ledger: Arc<dyn CommitmentLedgerClient>,
    pub advisory: Arc<AdvisoryTally>,
    pub master_key: Arc<MasterKey>,

    // Submissions hold it shared, freezing an election takes it exclusively.
    gate: Arc<RwLock<()>>,
}

impl Services {
    pub fn new(
        elections: Arc<dyn ElectionStore>,
        index: Arc<dyn VoteIndex>,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<dyn CommitmentLedgerClient>,
        advisory: Arc<AdvisoryTally>,
        master_key: Arc<MasterKey>,
    ) -> Self {
        Services {
            elections,
            index,
            blobs,
            ledger,
            advisory,
            master_key,
            gate: Arc::new(RwLock::new(())),
        }
    }

    /// Set the freeze flag once no submission is in flight
    pub(crate) fn freeze(&self, id: &ElectionId) -> Result<Election, Error> {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        self.elections.update(id, &mut |election| {
            if election.status != ElectionStatus::Active {
                return Err(Error::InvalidTransition {
                    election: election.id.clone(),
                    from: election.status,
                    to: ElectionStatus::Closed,
                });
            }
            election.submissions_frozen = true;
            Ok(())
        })
    }
}

/// Accepts ballots and drives the election lifecycle.
pub struct VoteSubmissionCoordinator {
    services: Services,
}

impl VoteSubmissionCoordinator {
    pub fn new(services: Services) -> Self {
        VoteSubmissionCoordinator { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Create a draft election and its key pair.
    ///
    /// The private key is returned here and nowhere else.
    pub fn create_election(
        &self,
        new: NewElection,
    ) -> Result<(Election, PrivateKeyHandoff), Error> {
        new.validate()?;

        let (public, handoff) = keygen::generate()?;
        let election = Election::new(new, public.to_pem().to_string())?;

        self.services.elections.insert(election.clone())?;
        self.services.advisory.register(&election);

        info!(
            "created {} election {} with {} options",
            election.choice_mode,
            election.id,
            election.options.len()
        );
        Ok((election, handoff))
    }

    /// Open a draft election for voting and announce it to the ledger
    pub fn open_election(&self, id: &ElectionId) -> Result<Election, Error> {
        let election = self
            .services
            .elections
            .update(id, &mut |e| e.transition(ElectionStatus::Active))?;
        self.services.advisory.register(&election);

        if let Err(e) = self
            .services
            .ledger
            .open_election(&election.id, &election.public_key)
        {
            warn!("could not register election {} on the ledger: {}", id, e);
        }

        info!("election {} is open", id);
        Ok(election)
    }

    pub fn cancel_election(&self, id: &ElectionId) -> Result<Election, Error> {
        let election = self
            .services
            .elections
            .update(id, &mut |e| e.transition(ElectionStatus::Cancelled))?;
        info!("election {} cancelled", id);
        Ok(election)
    }

    pub fn complete_election(&self, id: &ElectionId) -> Result<Election, Error> {
        let election = self
            .services
            .elections
            .update(id, &mut |e| e.transition(ElectionStatus::Completed))?;

        if let Some(mut results) = self.services.elections.results(id)? {
            results.status = election.status;
            self.services.elections.set_results(id, results)?;
        }

        info!("election {} completed", id);
        Ok(election)
    }

    pub fn election(&self, id: &ElectionId) -> Result<Election, Error> {
        self.services.elections.get(id)
    }

    pub fn elections(&self) -> Result<Vec<Election>, Error> {
        self.services.elections.list()
    }

    /// Elections visible to voters
    pub fn public_elections(&self) -> Result<Vec<Election>, Error> {
        Ok(self
            .services
            .elections
            .list()?
            .into_iter()
            .filter(|e| e.status.is_public())
            .collect())
    }

    pub fn has_voted(&self, id: &ElectionId, user_id: &str) -> Result<bool, Error> {
        self.services.index.has_voted(id, user_id)
    }

    /// Results of a recounted election
    pub fn results(&self, id: &ElectionId) -> Result<ElectionResults, Error> {
        let election = self.services.elections.get(id)?;
        if !election.status.has_results() {
            return Err(Error::InvalidElection(format!(
                "election {} is {} and has no results",
                id, election.status
            )));
        }

        self.services
            .elections
            .results(id)?
            .ok_or_else(|| Error::InvalidElection(format!("no results recorded for {}", id)))
    }

    /// Check a voter's receipt against the ledger.
    ///
    /// True when the ledger holds the receipt's commitment under its reference, and the local index
    /// does not tie the blob to some other reference.
    pub fn verify_receipt(&self, receipt: &Receipt) -> Result<bool, Error> {
        if let Some(reference) = self.services.index.reference_for(&receipt.blob_id)? {
            if reference != receipt.reference_id {
                debug!(
                    "receipt {} names reference {} but blob {} is indexed under {}",
                    receipt.receipt_id, receipt.reference_id, receipt.blob_id, reference
                );
                return Ok(false);
            }
        }

        let recorded = self
            .services
            .ledger
            .query_commitment(&receipt.reference_id)?;
        Ok(recorded == Some(receipt.commitment))
    }

    /// Accept one ballot.
    ///
    /// A user gets exactly one accepted ballot per election. If anything fails after the user is
    /// reserved, the reservation is released and any blob already written is securely deleted.
    pub fn submit(
        &self,
        election_id: &ElectionId,
        user_id: &str,
        choice: BallotChoice,
        comment: Option<String>,
    ) -> Result<Receipt, Error> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidIdentifier("user id must not be empty".into()));
        }

        let _gate = self
            .services
            .gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        if !self.services.index.try_mark_voted(election_id, user_id)? {
            return Err(Error::AlreadyVoted(election_id.clone()));
        }

        let mut written = None;
        match self.submit_reserved(election_id, choice, comment, &mut written) {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                debug!("rejected ballot for election {}: {}", election_id, e);
                self.roll_back(election_id, user_id, written);
                Err(e)
            }
        }
    }

    fn submit_reserved(
        &self,
        election_id: &ElectionId,
        choice: BallotChoice,
        comment: Option<String>,
        written: &mut Option<BlobId>,
    ) -> Result<Receipt, Error> {
        let election = self.services.elections.get(election_id)?;
        let now = Utc::now();

        if !election.accepts_votes_at(now) {
            return Err(Error::ElectionNotOpen(election_id.clone()));
        }

        let advisory_option = self.check_choice(&election, &choice)?;

        let payload = VotePayload {
            election_id: election_id.clone(),
            choice,
            comment,
            submitted_at: now,
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        let sealed = envelope::seal(&plaintext, &self.services.master_key)?;

        let blob_id = self.services.blobs.put(election_id, &sealed)?;
        *written = Some(blob_id.clone());

        let commitment = Commitment::of(&sealed);
        let reference = self
            .services
            .ledger
            .submit_commitment(election_id, &commitment)?;
        self.services
            .index
            .record_reference(&blob_id, reference.clone())?;

        if let Err(e) = self
            .services
            .advisory
            .record(election_id, advisory_option.as_deref())
        {
            warn!("advisory tally for {} not updated: {}", election_id, e);
        }
        self.services.elections.update(election_id, &mut |e| {
            e.total_votes += 1;
            Ok(())
        })?;

        debug!("accepted ballot {} in election {}", blob_id, election_id);

        Ok(Receipt {
            receipt_id: Uuid::new_v4(),
            election_id: election_id.clone(),
            blob_id,
            reference_id: reference,
            commitment,
            processed_at: Utc::now(),
            verification_code: verification_code(),
        })
    }

    // Returns the option to count in the advisory tally, if it is readable
    fn check_choice(
        &self,
        election: &Election,
        choice: &BallotChoice,
    ) -> Result<Option<String>, Error> {
        match (election.choice_mode, choice) {
            (ChoiceMode::Plain, BallotChoice::Plain { option_id }) => {
                if election.get_option(option_id).is_none() {
                    return Err(Error::InvalidOption(option_id.clone()));
                }
                Ok(Some(option_id.clone()))
            }
            (ChoiceMode::Sealed, BallotChoice::Sealed { ciphertext }) => {
                let public = ElectionPublicKey::from_pem(&election.public_key)?;
                let bytes = BASE64
                    .decode(ciphertext)
                    .map_err(|_| Error::InvalidOption("sealed choice is not base64".into()))?;
                if bytes.len() != public.ciphertext_len() {
                    return Err(Error::InvalidOption(format!(
                        "sealed choice must be {} bytes, got {}",
                        public.ciphertext_len(),
                        bytes.len()
                    )));
                }
                Ok(None)
            }
            (expected, _) => Err(Error::ChoiceModeMismatch {
                election: election.id.clone(),
                expected,
            }),
        }
    }

    fn roll_back(&self, election_id: &ElectionId, user_id: &str, written: Option<BlobId>) {
        if let Some(blob_id) = written {
            if let Err(e) = self.services.blobs.delete(&blob_id) {
                error!("could not delete orphaned blob {}: {}", blob_id, e);
            }
            if let Err(e) = self.services.index.remove_reference(&blob_id) {
                error!("could not remove reference for blob {}: {}", blob_id, e);
            }
        }

        if let Err(e) = self.services.index.unmark_voted(election_id, user_id) {
            error!(
                "could not release voter reservation in election {}: {}",
                election_id, e
            );
        }
    }
}
