use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::message::Message;
use crate::core::step::NegotiationStep;

/// Bump whenever the persisted layout of [`SessionRecord`] changes. Records
/// written under any other version are discarded on load.
pub const SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    #[default]
    None,
    Offered,
    Active,
    Expired,
    ExpiredFree,
}

impl TrialStatus {
    /// While a trial is on the table or running, price offers are held back.
    pub fn suppresses_offers(self) -> bool {
        matches!(self, Self::Offered | Self::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub status: SessionStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub transcript: Vec<Message>,
    #[serde(default)]
    pub step: NegotiationStep,
    #[serde(default)]
    pub current_offer_cents: Option<u64>,
    #[serde(default)]
    pub confirmed_offer_cents: Option<u64>,
    #[serde(default)]
    pub payment_link: Option<String>,
    #[serde(default)]
    pub awaiting_confirmation: bool,
    #[serde(default)]
    pub offer_history: Vec<u64>,
    #[serde(default)]
    pub trial_status: TrialStatus,
    #[serde(default)]
    pub trial_offer_cents: Option<u64>,
    #[serde(default)]
    pub trial_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_declined: bool,
    pub schema_version: u32,
}

impl SessionRecord {
    pub fn new(owner_id: String) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            status: SessionStatus::Active,
            updated_at: Utc::now(),
            transcript: Vec::new(),
            step: NegotiationStep::None,
            current_offer_cents: None,
            confirmed_offer_cents: None,
            payment_link: None,
            awaiting_confirmation: false,
            offer_history: Vec::new(),
            trial_status: TrialStatus::None,
            trial_offer_cents: None,
            trial_ends_at: None,
            trial_declined: false,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Placeholder state for a context that has not created or restored a
    /// session yet. It has no session id and is never persisted as-is.
    pub fn blank(owner_id: String) -> Self {
        Self {
            session_id: String::new(),
            ..Self::new(owner_id)
        }
    }

    pub fn is_blank(&self) -> bool {
        self.session_id.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn last_offer(&self) -> Option<u64> {
        self.offer_history.last().copied()
    }

    pub fn lowest_offer(&self) -> Option<u64> {
        self.offer_history.iter().copied().min()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
