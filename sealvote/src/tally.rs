use crate::*;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Vote counts keyed by option id, in ballot order
pub type Tally = IndexMap<String, u64>;

/// Zeroed tally for every option of an election
pub fn empty_tally(election: &Election) -> Tally {
    election.option_ids().map(|id| (id.to_string(), 0)).collect()
}

/// How far the ledger could vouch for a recount
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Every counted blob was checked against the ledger
    Verified,

    /// The ledger was unreachable for some or all blobs, which were counted unchecked
    Degraded,
}

struct Counters {
    options: IndexMap<String, AtomicU64>,
    total: AtomicU64,
}

/// Running per-option counts maintained as votes come in.
///
/// Only ever advisory: recount produces the authoritative tally and overrides this one.
/// Sealed elections have no readable choice, so only their totals are tracked.
#[derive(Default)]
pub struct AdvisoryTally {
    elections: RwLock<HashMap<ElectionId, Counters>>,
}

/// Serializable advisory counts
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AdvisorySnapshot {
    pub options: Tally,
    pub total: u64,
}

impl AdvisoryTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting for an election. Existing counts are kept.
    pub fn register(&self, election: &Election) {
        let mut elections = self
            .elections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        elections.entry(election.id.clone()).or_insert_with(|| Counters {
            options: election
                .option_ids()
                .map(|id| (id.to_string(), AtomicU64::new(0)))
                .collect(),
            total: AtomicU64::new(0),
        });
    }

    /// Count one vote. `option_id` is `None` for sealed ballots.
    pub fn record(&self, election: &ElectionId, option_id: Option<&str>) -> Result<(), Error> {
        let elections = self
            .elections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let counters = elections
            .get(election)
            .ok_or_else(|| Error::ElectionNotFound(election.clone()))?;

        if let Some(option_id) = option_id {
            counters
                .options
                .get(option_id)
                .ok_or_else(|| Error::InvalidOption(option_id.to_string()))?
                .fetch_add(1, Ordering::SeqCst);
        }
        counters.total.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    pub fn get(&self, election: &ElectionId) -> Option<AdvisorySnapshot> {
        let elections = self
            .elections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        elections.get(election).map(|counters| AdvisorySnapshot {
            options: counters
                .options
                .iter()
                .map(|(id, count)| (id.clone(), count.load(Ordering::SeqCst)))
                .collect(),
            total: counters.total.load(Ordering::SeqCst),
        })
    }

    pub fn snapshot(&self) -> BTreeMap<ElectionId, AdvisorySnapshot> {
        let ids: Vec<ElectionId> = self
            .elections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();

        ids.into_iter()
            .filter_map(|id| self.get(&id).map(|snapshot| (id, snapshot)))
            .collect()
    }

    pub fn from_snapshot(snapshot: BTreeMap<ElectionId, AdvisorySnapshot>) -> Self {
        let elections = snapshot
            .into_iter()
            .map(|(id, snapshot)| {
                let counters = Counters {
                    options: snapshot
                        .options
                        .into_iter()
                        .map(|(option, count)| (option, AtomicU64::new(count)))
                        .collect(),
                    total: AtomicU64::new(snapshot.total),
                };
                (id, counters)
            })
            .collect();

        AdvisoryTally {
            elections: RwLock::new(elections),
        }
    }
}

/// Where the advisory count disagrees with the recount
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    /// `None` for the total number of votes
    pub option_id: Option<String>,
    pub advisory: u64,
    pub authoritative: u64,
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.option_id {
            Some(option) => write!(f, "option {}", option)?,
            None => write!(f, "total")?,
        }
        write!(
            f,
            ": advisory {} vs authoritative {}",
            self.advisory, self.authoritative
        )
    }
}

/// Compare the advisory counts against the authoritative tally.
///
/// Per-option counts are only compared when the advisory tally has them.
pub fn discrepancies(
    advisory: &AdvisorySnapshot,
    authoritative: &Tally,
    mode: ChoiceMode,
) -> Vec<Discrepancy> {
    let mut found = vec![];

    if mode == ChoiceMode::Plain {
        for (option_id, count) in authoritative.iter() {
            let advised = advisory.options.get(option_id).copied().unwrap_or(0);
            if advised != *count {
                found.push(Discrepancy {
                    option_id: Some(option_id.clone()),
                    advisory: advised,
                    authoritative: *count,
                });
            }
        }
    }

    let total: u64 = authoritative.values().sum();
    if advisory.total != total {
        found.push(Discrepancy {
            option_id: None,
            advisory: advisory.total,
            authoritative: total,
        });
    }

    found
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionResult {
    pub option_id: String,
    pub label: String,
    pub votes: u64,
    pub percentage: f64,
}

/// Published results of a recounted election
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElectionResults {
    pub election_id: ElectionId,
    pub title: String,
    pub status: ElectionStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub total_votes: u64,
    pub results: Vec<OptionResult>,
    pub trust: TrustLevel,
    pub anomalies: usize,
}

impl ElectionResults {
    pub fn new(election: &Election, tally: &Tally, trust: TrustLevel, anomalies: usize) -> Self {
        let total_votes: u64 = tally.values().sum();

        let results = election
            .options
            .iter()
            .map(|option| {
                let votes = tally.get(&option.id).copied().unwrap_or(0);
                OptionResult {
                    option_id: option.id.clone(),
                    label: option.label.clone(),
                    votes,
                    percentage: percentage(votes, total_votes),
                }
            })
            .collect();

        ElectionResults {
            election_id: election.id.clone(),
            title: election.title.clone(),
            status: election.status,
            closed_at: election.closed_at,
            total_votes,
            results,
            trust,
            anomalies,
        }
    }

    /// Option with the most votes, if there is a single one
    pub fn winner(&self) -> Option<&OptionResult> {
        let top = self.results.iter().map(|r| r.votes).max()?;
        let mut leaders = self.results.iter().filter(|r| r.votes == top);
        match (leaders.next(), leaders.next()) {
            (Some(leader), None) if top > 0 => Some(leader),
            _ => None,
        }
    }
}

// Percentage rounded to two decimals
fn percentage(votes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (votes as f64 * 10000.0 / total as f64).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use std::thread;

    fn election(mode: ChoiceMode) -> Election {
        let now = Utc::now();
        let new = NewElection {
            id: ElectionId::new("tally").unwrap(),
            title: "Tally".into(),
            description: String::new(),
            options: vec![
                ElectionOption::new("a", "Option A", 0),
                ElectionOption::new("b", "Option B", 1),
                ElectionOption::new("c", "Option C", 2),
            ],
            start_time: now,
            end_time: now + Duration::hours(1),
            choice_mode: mode,
            created_by: "admin".into(),
        };
        Election::new(new, String::new()).unwrap()
    }

    #[test]
    fn test_advisory_tally_concurrent() {
        let election = election(ChoiceMode::Plain);
        let tally = Arc::new(AdvisoryTally::new());
        tally.register(&election);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tally = tally.clone();
                let id = election.id.clone();
                thread::spawn(move || {
                    let option = if i % 2 == 0 { "a" } else { "b" };
                    for _ in 0..250 {
                        tally.record(&id, Some(option)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let counts = tally.get(&election.id).unwrap();
        assert_eq!(counts.options["a"], 1000);
        assert_eq!(counts.options["b"], 1000);
        assert_eq!(counts.options["c"], 0);
        assert_eq!(counts.total, 2000);

        assert!(matches!(
            tally.record(&election.id, Some("z")),
            Err(Error::InvalidOption(_))
        ));

        let restored = AdvisoryTally::from_snapshot(tally.snapshot());
        assert_eq!(restored.get(&election.id), Some(counts));
    }

    #[test]
    fn test_discrepancies() {
        let mut authoritative = empty_tally(&election(ChoiceMode::Plain));
        authoritative["a"] = 2;
        authoritative["b"] = 1;

        let mut advisory = AdvisorySnapshot {
            options: authoritative.clone(),
            total: 3,
        };
        assert!(discrepancies(&advisory, &authoritative, ChoiceMode::Plain).is_empty());

        advisory.options["a"] = 3;
        advisory.total = 4;
        let found = discrepancies(&advisory, &authoritative, ChoiceMode::Plain);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].option_id.as_deref(), Some("a"));
        assert_eq!(found[0].to_string(), "option a: advisory 3 vs authoritative 2");
        assert_eq!(found[1].option_id, None);

        // Sealed elections compare totals only
        let sealed = AdvisorySnapshot {
            options: empty_tally(&election(ChoiceMode::Sealed)),
            total: 3,
        };
        assert!(discrepancies(&sealed, &authoritative, ChoiceMode::Sealed).is_empty());
    }

    #[test]
    fn test_results() {
        let election = election(ChoiceMode::Plain);
        let mut tally = empty_tally(&election);
        tally["a"] = 2;
        tally["b"] = 1;

        let results = ElectionResults::new(&election, &tally, TrustLevel::Verified, 0);
        assert_eq!(results.total_votes, 3);
        assert_eq!(results.results[0].percentage, 66.67);
        assert_eq!(results.results[1].percentage, 33.33);
        assert_eq!(results.results[2].percentage, 0.0);
        assert_eq!(results.winner().map(|r| r.option_id.as_str()), Some("a"));

        tally["b"] = 2;
        let tied = ElectionResults::new(&election, &tally, TrustLevel::Verified, 0);
        assert!(tied.winner().is_none());

        let empty = ElectionResults::new(&election, &empty_tally(&election), TrustLevel::Degraded, 0);
        assert_eq!(empty.results[0].percentage, 0.0);
        assert!(empty.winner().is_none());
    }
}
