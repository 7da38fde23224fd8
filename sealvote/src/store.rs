use crate::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

/// Election registry
pub trait ElectionStore: Send + Sync {
    /// Add a new election. Fails if the id is taken.
    fn insert(&self, election: Election) -> Result<(), Error>;

    fn get(&self, id: &ElectionId) -> Result<Election, Error>;

    fn list(&self) -> Result<Vec<Election>, Error>;

    /// Apply `change` to an election atomically, returning the updated election.
    ///
    /// If `change` fails the stored election is left untouched.
    fn update(
        &self,
        id: &ElectionId,
        change: &mut dyn FnMut(&mut Election) -> Result<(), Error>,
    ) -> Result<Election, Error>;

    fn set_results(&self, id: &ElectionId, results: ElectionResults) -> Result<(), Error>;

    fn results(&self, id: &ElectionId) -> Result<Option<ElectionResults>, Error>;
}

/// Who has voted, and where each blob's commitment lives on the ledger.
///
/// Voter identities are kept apart from blobs: nothing here links a user to a blob.
pub trait VoteIndex: Send + Sync {
    /// Atomically mark the user as having voted. Returns `false` if they already had.
    fn try_mark_voted(&self, election: &ElectionId, user_id: &str) -> Result<bool, Error>;

    /// Release a reservation made by `try_mark_voted`
    fn unmark_voted(&self, election: &ElectionId, user_id: &str) -> Result<(), Error>;

    fn has_voted(&self, election: &ElectionId, user_id: &str) -> Result<bool, Error>;

    fn voter_count(&self, election: &ElectionId) -> Result<usize, Error>;

    fn record_reference(&self, blob: &BlobId, reference: ReferenceId) -> Result<(), Error>;

    fn reference_for(&self, blob: &BlobId) -> Result<Option<ReferenceId>, Error>;

    fn remove_reference(&self, blob: &BlobId) -> Result<(), Error>;
}

/// Serializable contents of a `MemElectionStore`
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ElectionSnapshot {
    pub elections: BTreeMap<ElectionId, Election>,
    #[serde(default)]
    pub results: BTreeMap<ElectionId, ElectionResults>,
}

/// A simple election store that uses an in-memory BTreeMap
#[derive(Default)]
pub struct MemElectionStore {
    inner: RwLock<ElectionSnapshot>,
}

impl MemElectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: ElectionSnapshot) -> Self {
        MemElectionStore {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> ElectionSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ElectionStore for MemElectionStore {
    fn insert(&self, election: Election) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.elections.contains_key(&election.id) {
            return Err(Error::InvalidElection(format!(
                "election {} already exists",
                election.id
            )));
        }
        inner.elections.insert(election.id.clone(), election);
        Ok(())
    }

    fn get(&self, id: &ElectionId) -> Result<Election, Error> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .elections
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ElectionNotFound(id.clone()))
    }

    fn list(&self) -> Result<Vec<Election>, Error> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut elections: Vec<Election> = inner.elections.values().cloned().collect();
        elections.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(elections)
    }

    fn update(
        &self,
        id: &ElectionId,
        change: &mut dyn FnMut(&mut Election) -> Result<(), Error>,
    ) -> Result<Election, Error> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stored = inner
            .elections
            .get_mut(id)
            .ok_or_else(|| Error::ElectionNotFound(id.clone()))?;

        let mut updated = stored.clone();
        change(&mut updated)?;
        *stored = updated.clone();

        Ok(updated)
    }

    fn set_results(&self, id: &ElectionId, results: ElectionResults) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.elections.contains_key(id) {
            return Err(Error::ElectionNotFound(id.clone()));
        }
        inner.results.insert(id.clone(), results);
        Ok(())
    }

    fn results(&self, id: &ElectionId) -> Result<Option<ElectionResults>, Error> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .results
            .get(id)
            .cloned())
    }
}

/// Serializable contents of a `MemVoteIndex`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VoteIndexSnapshot {
    pub voted: BTreeMap<ElectionId, BTreeSet<String>>,
    pub references: BTreeMap<BlobId, ReferenceId>,
}

/// In-memory vote index.
///
/// The voted set and the reference index sit under separate locks. Marking a voter is a
/// single test-and-insert under the write lock.
#[derive(Default)]
pub struct MemVoteIndex {
    voted: RwLock<BTreeMap<ElectionId, BTreeSet<String>>>,
    references: RwLock<BTreeMap<BlobId, ReferenceId>>,
}

impl MemVoteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: VoteIndexSnapshot) -> Self {
        MemVoteIndex {
            voted: RwLock::new(snapshot.voted),
            references: RwLock::new(snapshot.references),
        }
    }

    pub fn snapshot(&self) -> VoteIndexSnapshot {
        VoteIndexSnapshot {
            voted: self
                .voted
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            references: self
                .references
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl VoteIndex for MemVoteIndex {
    fn try_mark_voted(&self, election: &ElectionId, user_id: &str) -> Result<bool, Error> {
        Ok(self
            .voted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(election.clone())
            .or_default()
            .insert(user_id.to_string()))
    }

    fn unmark_voted(&self, election: &ElectionId, user_id: &str) -> Result<(), Error> {
        let mut voted = self.voted.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(users) = voted.get_mut(election) {
            users.remove(user_id);
        }
        Ok(())
    }

    fn has_voted(&self, election: &ElectionId, user_id: &str) -> Result<bool, Error> {
        Ok(self
            .voted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(election)
            .map(|users| users.contains(user_id))
            .unwrap_or(false))
    }

    fn voter_count(&self, election: &ElectionId) -> Result<usize, Error> {
        Ok(self
            .voted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(election)
            .map(|users| users.len())
            .unwrap_or(0))
    }

    fn record_reference(&self, blob: &BlobId, reference: ReferenceId) -> Result<(), Error> {
        self.references
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(blob.clone(), reference);
        Ok(())
    }

    fn reference_for(&self, blob: &BlobId) -> Result<Option<ReferenceId>, Error> {
        Ok(self
            .references
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(blob)
            .cloned())
    }

    fn remove_reference(&self, blob: &BlobId) -> Result<(), Error> {
        self.references
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(blob);
        Ok(())
    }
}
