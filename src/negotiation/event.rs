use crate::core::message::Message;
use crate::core::session::TrialStatus;
use crate::core::step::NegotiationStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    OwnershipLost,
    UsageLimit,
    Concluded,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageAppended {
        message: Message,
    },
    StepChanged {
        from: NegotiationStep,
        to: NegotiationStep,
    },
    OfferUpdated {
        cents: u64,
    },
    TrialChanged {
        status: TrialStatus,
        offer_cents: Option<u64>,
    },
    PaymentLink {
        url: String,
    },
    /// Another context owns the session; `message` is its latest transcript
    /// entry, if any.
    Observed {
        session_id: String,
        message: Option<Message>,
    },
    SessionEnded {
        reason: EndReason,
    },
}
