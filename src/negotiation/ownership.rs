use chrono::{DateTime, Duration, Utc};

use crate::core::session::SessionRecord;
use crate::storage::StoreChange;

/// What a context should do about a change written by someone else.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeVerdict {
    Ignore,
    /// Observer context: show the other owner's record read-only.
    Mirror(SessionRecord),
    /// Owner context: someone else took the session over.
    Invalidate,
}

#[derive(Debug, Clone)]
struct OwnedSession {
    session_id: String,
    since_revision: u64,
}

/// Exclusive-writer election for one context among several sharing a store.
#[derive(Debug, Clone)]
pub struct SessionOwnership {
    context_id: String,
    owner_timeout: Duration,
    owned: Option<OwnedSession>,
    invalidated: bool,
}

impl SessionOwnership {
    pub fn new(context_id: String, owner_timeout_secs: u64) -> Self {
        Self {
            context_id,
            owner_timeout: Duration::seconds(owner_timeout_secs.min(i64::MAX as u64) as i64),
            owned: None,
            invalidated: false,
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn is_owner(record: &SessionRecord, context_id: &str) -> bool {
        record.owner_id == context_id
    }

    pub fn believes_owner(&self) -> bool {
        self.owned.is_some() && !self.invalidated
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn owned_session(&self) -> Option<&str> {
        self.owned.as_ref().map(|o| o.session_id.as_str())
    }

    /// Whether this context may write a new record over `existing`: the slot
    /// is empty, finished, already ours, or its owner has gone quiet.
    pub fn can_claim(&self, existing: Option<&SessionRecord>, now: DateTime<Utc>) -> bool {
        match existing {
            None => true,
            Some(record) if !record.is_active() => true,
            Some(record) if Self::is_owner(record, &self.context_id) => true,
            Some(record) => now - record.updated_at > self.owner_timeout,
        }
    }

    /// Produce the record this context should write to take ownership, or
    /// `None` if another live owner holds the session. A record this context
    /// already owns is reused as-is.
    pub fn claim(
        &self,
        existing: Option<&SessionRecord>,
        now: DateTime<Utc>,
    ) -> Option<SessionRecord> {
        if !self.can_claim(existing, now) {
            tracing::info!(context = %self.context_id, "claim refused, session owned elsewhere");
            return None;
        }
        match existing {
            Some(record)
                if record.is_active() && Self::is_owner(record, &self.context_id) =>
            {
                Some(record.clone())
            }
            _ => Some(SessionRecord::new(self.context_id.clone())),
        }
    }

    /// A brand-new record owned by this context, regardless of who holds the
    /// slot now. Used by an explicit restart.
    pub fn take_over(&self) -> SessionRecord {
        SessionRecord::new(self.context_id.clone())
    }

    /// Record that `session_id` was written by this context at `revision`.
    pub fn confirm(&mut self, session_id: &str, revision: u64) {
        tracing::debug!(context = %self.context_id, session = session_id, revision, "ownership confirmed");
        self.owned = Some(OwnedSession {
            session_id: session_id.to_string(),
            since_revision: revision,
        });
        self.invalidated = false;
    }

    pub fn invalidate(&mut self) {
        if !self.invalidated {
            tracing::info!(context = %self.context_id, "ownership lost");
        }
        self.invalidated = true;
    }

    /// Give up ownership without invalidation (session concluded).
    pub fn release(&mut self) {
        self.owned = None;
    }

    pub fn observe(&self, change: &StoreChange) -> ChangeVerdict {
        if self.invalidated {
            return ChangeVerdict::Ignore;
        }

        match &self.owned {
            Some(owned) => {
                if change.revision <= owned.since_revision {
                    return ChangeVerdict::Ignore;
                }
                match &change.record {
                    Some(record)
                        if record.session_id != owned.session_id
                            || record.owner_id != self.context_id =>
                    {
                        ChangeVerdict::Invalidate
                    }
                    _ => ChangeVerdict::Ignore,
                }
            }
            None => match &change.record {
                Some(record) if !Self::is_owner(record, &self.context_id) => {
                    ChangeVerdict::Mirror(record.clone())
                }
                _ => ChangeVerdict::Ignore,
            },
        }
    }
}
