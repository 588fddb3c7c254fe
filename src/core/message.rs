use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferType {
    Price,
    Trial,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_cents: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_type: Option<OfferType>,
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

impl MessageMeta {
    pub fn price(cents: u64) -> Self {
        Self {
            offer_cents: Some(cents),
            offer_type: Some(OfferType::Price),
            is_final: false,
        }
    }

    pub fn trial(cents: u64) -> Self {
        Self {
            offer_cents: Some(cents),
            offer_type: Some(OfferType::Trial),
            is_final: false,
        }
    }

    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.offer_cents.is_none() && self.offer_type.is_none() && !self.is_final
    }
}

/// One transcript entry. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub text: String,
    #[serde(default)]
    pub meta: MessageMeta,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new_user(text: String) -> Self {
        Self::new(MessageRole::User, text, MessageMeta::default())
    }

    pub fn new_assistant(text: String, meta: MessageMeta) -> Self {
        Self::new(MessageRole::Assistant, text, meta)
    }

    fn new(role: MessageRole, text: String, meta: MessageMeta) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text,
            meta,
            created_at: Utc::now(),
        }
    }

    pub fn offer_cents(&self) -> Option<u64> {
        self.meta.offer_cents
    }

    pub fn is_trial_offer(&self) -> bool {
        self.meta.offer_type == Some(OfferType::Trial)
    }
}
