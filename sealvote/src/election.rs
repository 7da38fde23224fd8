use crate::*;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 10;
pub const MAX_ELECTION_ID_LENGTH: usize = 50;

/// Election identifier, `[A-Za-z0-9_-]{1,50}`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ElectionId(String);

impl ElectionId {
    pub fn new<S: Into<String>>(id: S) -> Result<Self, Error> {
        let id = id.into();
        let valid_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';

        if id.is_empty() || id.len() > MAX_ELECTION_ID_LENGTH || !id.chars().all(valid_char) {
            return Err(Error::InvalidIdentifier(format!(
                "election id {:?} must match [A-Za-z0-9_-]{{1,{}}}",
                id, MAX_ELECTION_ID_LENGTH
            )));
        }

        Ok(ElectionId(id))
    }

    /// Generate a random election id
    pub fn generate() -> Self {
        ElectionId(format!("election-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ElectionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ElectionId::new(s)
    }
}

impl TryFrom<String> for ElectionId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ElectionId::new(s)
    }
}

impl From<ElectionId> for String {
    fn from(id: ElectionId) -> String {
        id.0
    }
}

/// Lifecycle of an election. Status only ever moves forward.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ElectionStatus {
    Draft,
    Active,
    Closed,
    Completed,
    Cancelled,
}

impl ElectionStatus {
    pub fn code(&self) -> &'static str {
        match self {
            ElectionStatus::Draft => "draft",
            ElectionStatus::Active => "active",
            ElectionStatus::Closed => "closed",
            ElectionStatus::Completed => "completed",
            ElectionStatus::Cancelled => "cancelled",
        }
    }

    pub fn allows_voting(&self) -> bool {
        *self == ElectionStatus::Active
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ElectionStatus::Completed | ElectionStatus::Cancelled)
    }

    pub fn has_results(&self) -> bool {
        matches!(self, ElectionStatus::Closed | ElectionStatus::Completed)
    }

    /// Whether the election is listed publicly
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            ElectionStatus::Active | ElectionStatus::Closed | ElectionStatus::Completed
        )
    }

    pub fn can_transition_to(&self, to: ElectionStatus) -> bool {
        use ElectionStatus::*;
        matches!(
            (*self, to),
            (Draft, Active)
                | (Active, Closed)
                | (Closed, Completed)
                | (Draft, Cancelled)
                | (Active, Cancelled)
        )
    }
}

impl fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for ElectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(ElectionStatus::Draft),
            "active" => Ok(ElectionStatus::Active),
            "closed" => Ok(ElectionStatus::Closed),
            "completed" => Ok(ElectionStatus::Completed),
            "cancelled" => Ok(ElectionStatus::Cancelled),
            _ => Err(Error::InvalidIdentifier(format!("unknown election status {}", s))),
        }
    }
}

/// How ballots in an election carry their choice.
///
/// In `Sealed` elections the option id is RSA-encrypted by the voter under the election public
/// key before it reaches the server, so only the private-key holder can read it at recount.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChoiceMode {
    Plain,
    Sealed,
}

impl fmt::Display for ChoiceMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChoiceMode::Plain => write!(f, "plain"),
            ChoiceMode::Sealed => write!(f, "sealed"),
        }
    }
}

impl FromStr for ChoiceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(ChoiceMode::Plain),
            "sealed" => Ok(ChoiceMode::Sealed),
            _ => Err(Error::InvalidIdentifier(format!("unknown choice mode {}", s))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ElectionOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub order: u32,
}

impl ElectionOption {
    pub fn new<I: Into<String>, L: Into<String>>(id: I, label: L, order: u32) -> Self {
        ElectionOption {
            id: id.into(),
            label: label.into(),
            description: None,
            order,
        }
    }
}

/// Everything needed to create an election. The key pair is generated on creation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NewElection {
    pub id: ElectionId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub options: Vec<ElectionOption>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub choice_mode: ChoiceMode,
    pub created_by: String,
}

impl NewElection {
    /// Validate the election definition
    pub fn validate(&self) -> Result<(), Error> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidElection("title must not be empty".into()));
        }

        if self.options.len() < MIN_OPTIONS || self.options.len() > MAX_OPTIONS {
            return Err(Error::InvalidElection(format!(
                "an election needs between {} and {} options, got {}",
                MIN_OPTIONS,
                MAX_OPTIONS,
                self.options.len()
            )));
        }

        let mut seen = HashSet::new();
        for option in self.options.iter() {
            if option.id.trim().is_empty() || option.label.trim().is_empty() {
                return Err(Error::InvalidElection(
                    "option ids and labels must not be empty".into(),
                ));
            }
            if !seen.insert(option.id.as_str()) {
                return Err(Error::InvalidElection(format!(
                    "duplicate option id {}",
                    option.id
                )));
            }
        }

        if self.end_time <= self.start_time {
            return Err(Error::InvalidElection(
                "end time must be after start time".into(),
            ));
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Election {
    pub id: ElectionId,
    pub title: String,
    pub description: String,

    /// Options in ballot order
    pub options: Vec<ElectionOption>,

    pub status: ElectionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub choice_mode: ChoiceMode,

    /// Election public key, SPKI PEM.
    ///
    /// Voters in sealed elections encrypt their choice under this key.
    pub public_key: String,

    pub total_votes: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    /// Set when a recount begins. No submission is accepted afterwards.
    #[serde(default)]
    pub submissions_frozen: bool,
}

impl Election {
    /// Build a draft election from a validated definition
    pub fn new(new: NewElection, public_key: String) -> Result<Self, Error> {
        new.validate()?;

        let mut options = new.options;
        options.sort_by_key(|o| o.order);

        Ok(Election {
            id: new.id,
            title: new.title,
            description: new.description,
            options,
            status: ElectionStatus::Draft,
            start_time: new.start_time,
            end_time: new.end_time,
            choice_mode: new.choice_mode,
            public_key,
            total_votes: 0,
            created_by: new.created_by,
            created_at: Utc::now(),
            closed_at: None,
            submissions_frozen: false,
        })
    }

    /// Get an option with the given ID
    pub fn get_option(&self, option_id: &str) -> Option<&ElectionOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    pub fn option_ids(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(|o| o.id.as_str())
    }

    /// Whether a ballot submitted at `now` may be accepted
    pub fn accepts_votes_at(&self, now: DateTime<Utc>) -> bool {
        self.status.allows_voting()
            && !self.submissions_frozen
            && now >= self.start_time
            && now < self.end_time
    }

    /// Move the election to a new status, refusing anything but a forward step
    pub fn transition(&mut self, to: ElectionStatus) -> Result<(), Error> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                election: self.id.clone(),
                from: self.status,
                to,
            });
        }

        if to == ElectionStatus::Closed {
            self.closed_at = Some(Utc::now());
        }
        self.status = to;
        Ok(())
    }
}
