//! Core domain model for the finfo forum updater.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "finfo-core";

/// Trailing marker the forum uses for masked policy-holder names.
pub const INSURER_MARKER: char = '*';

/// Floor of the original post inside a thread; replies start at 1.
pub const ORIGINAL_POST_FLOOR: u32 = 0;

/// Names ending in the insurer marker are masked and never deduplicated.
pub fn is_decorated(display_name: &str) -> bool {
    display_name.ends_with(INSURER_MARKER)
}

/// Closed topic taxonomy. Ordinals are 1-based, matching the `topic_id` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    CoveragePlanning,
    PolicyReview,
    ClaimApplication,
    PolicySurrender,
    InsuranceConcepts,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::CoveragePlanning,
        Topic::PolicyReview,
        Topic::ClaimApplication,
        Topic::PolicySurrender,
        Topic::InsuranceConcepts,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Topic::CoveragePlanning => "投保規劃",
            Topic::PolicyReview => "保單健檢",
            Topic::ClaimApplication => "理賠申請",
            Topic::PolicySurrender => "保單解約",
            Topic::InsuranceConcepts => "保險觀念",
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            Topic::CoveragePlanning => 1,
            Topic::PolicyReview => 2,
            Topic::ClaimApplication => 3,
            Topic::PolicySurrender => 4,
            Topic::InsuranceConcepts => 5,
        }
    }

    /// Exact label match; no trimming or normalization.
    pub fn from_label(label: &str) -> Option<Topic> {
        Self::ALL.into_iter().find(|topic| topic.label() == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    /// Policy-holder; the forum masks these names.
    Insurer,
    Salesman,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub user_name: String,
    pub identity: Identity,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl Author {
    pub fn new(user_name: impl Into<String>, identity: Identity) -> Self {
        Self {
            user_name: user_name.into(),
            identity,
            sex: None,
            region: None,
        }
    }

    pub fn is_insurer(&self) -> bool {
        self.identity == Identity::Insurer
    }
}

/// Interchange record produced by an extractor for one forum thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: u64,
    pub title: String,
    /// Topic label as displayed by the forum.
    #[serde(rename = "class")]
    pub topic_label: String,
    /// Short `MM/DD` date.
    pub date_time: String,
    pub author: Author,
    pub content: String,
    /// Non-deleted replies in page order.
    #[serde(default)]
    pub replies: Vec<Reply>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    /// Consultation id; only salesmen replies carry one.
    #[serde(default)]
    pub id: Option<String>,
    pub floor: u32,
    pub date_time: String,
    pub author: Author,
    pub content: String,
    pub belongs_to: u64,
}

/// One row of the `posts` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRow {
    pub post_id: u64,
    pub title: String,
    pub floor: u32,
    pub create_time: NaiveDate,
    pub author_id: u64,
    pub topic_id: u8,
    pub content: String,
}

/// Candidate row for the `users` table; the surrogate id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRow {
    pub display_name: String,
    pub is_insurer: bool,
}

impl UserRow {
    pub fn is_decorated(&self) -> bool {
        is_decorated(&self.display_name)
    }
}

/// A persisted user as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUser {
    pub surrogate_id: u64,
    pub display_name: String,
    pub is_insurer: bool,
}
