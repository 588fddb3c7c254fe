use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::RemoteError;
use crate::core::message::Message;
use crate::core::session::TrialStatus;
use crate::core::step::NegotiationStep;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntroRequest {
    pub transcript: Vec<Message>,
    pub step: NegotiationStep,
    pub latest_utterance: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntroReply {
    #[serde(default)]
    pub reply_parts: Vec<String>,
    #[serde(default)]
    pub next_step: Option<NegotiationStep>,
    #[serde(default)]
    pub offer_trial: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationMeta {
    pub current_offer_cents: Option<u64>,
    pub offer_history: Vec<u64>,
    pub awaiting_confirmation: bool,
    pub trial_status: TrialStatus,
    pub trial_declined: bool,
    pub latest_utterance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRequest {
    pub transcript: Vec<Message>,
    pub meta: NegotiationMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationReply {
    #[serde(default)]
    pub reply_parts: Vec<String>,
    #[serde(default)]
    pub suggested_price_cents: Option<u64>,
    #[serde(default)]
    pub ask_confirmation: Option<bool>,
    #[serde(default)]
    pub offer_trial: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceConfirmation {
    pub confirmed_price_cents: u64,
    #[serde(default)]
    pub payment_link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialRequest {
    pub trial_offer_cents: u64,
    pub transcript: Vec<Message>,
    pub offer_meta: NegotiationMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialGrant {
    pub trial_status: TrialStatus,
    pub trial_offer_cents: u64,
    pub trial_ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeContinuation {
    pub trial_status: TrialStatus,
}

/// Server-authoritative negotiation state, consulted once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationStatus {
    #[serde(default)]
    pub negotiation_history: Option<Vec<Message>>,
    #[serde(default)]
    pub confirmed_price: Option<u64>,
    #[serde(default)]
    pub payment_link: Option<String>,
    #[serde(default)]
    pub offer_history: Option<Vec<u64>>,
    #[serde(default)]
    pub trial_status: Option<TrialStatus>,
    #[serde(default)]
    pub trial_offer_cents: Option<u64>,
    #[serde(default)]
    pub trial_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_status: Option<String>,
}

impl NegotiationStatus {
    pub fn is_paid(&self) -> bool {
        matches!(self.payment_status.as_deref(), Some("paid") | Some("completed"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub transcript: Vec<Message>,
    pub offer_history: Vec<u64>,
    pub trial_status: TrialStatus,
    pub trial_offer_cents: Option<u64>,
}

/// The remote reasoning backend. Every call may fail; a
/// [`RemoteError::UsageLimit`] failure ends the session for good.
#[async_trait]
pub trait NegotiationService: Send + Sync {
    async fn intro_step(&self, req: IntroRequest) -> Result<IntroReply, RemoteError>;

    async fn negotiation_step(
        &self,
        req: NegotiationRequest,
    ) -> Result<NegotiationReply, RemoteError>;

    async fn confirm_price(&self, price_cents: u64) -> Result<PriceConfirmation, RemoteError>;

    async fn start_trial(&self, req: TrialRequest) -> Result<TrialGrant, RemoteError>;

    async fn continue_free(&self) -> Result<FreeContinuation, RemoteError>;

    async fn negotiation_status(&self) -> Result<NegotiationStatus, RemoteError>;

    /// Best-effort; callers ignore failures.
    async fn sync_state(&self, snapshot: SyncSnapshot) -> Result<(), RemoteError>;
}
