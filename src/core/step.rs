use serde::{Deserialize, Serialize};

use crate::core::error::NegotiationError;

/// Conversation step of a negotiation session.
///
/// ```text
/// None -> IntroReason -> IntroAskUseful -> Negotiating <-> AwaitingConfirmation
///                                              |                 |
///                                              +-> PriceConfirmed <+
///                                                       |
///                                                  PaymentComplete
/// any -> Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStep {
    #[default]
    None,
    IntroReason,
    IntroAskUseful,
    Negotiating,
    AwaitingConfirmation,
    PriceConfirmed,
    PaymentComplete,
    Done,
}

impl NegotiationStep {
    pub fn is_intro(self) -> bool {
        matches!(self, Self::IntroReason | Self::IntroAskUseful)
    }

    pub fn is_negotiating(self) -> bool {
        matches!(self, Self::Negotiating | Self::AwaitingConfirmation)
    }

    /// Terminal steps reject negotiation input. Payment, trial follow-up and
    /// restart operations are still allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::PriceConfirmed | Self::PaymentComplete | Self::Done)
    }

    pub fn accepts_negotiation_input(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition(self, to: NegotiationStep) -> bool {
        use NegotiationStep::*;

        if self == to || to == Done {
            return true;
        }
        matches!(
            (self, to),
            (None, IntroReason)
                | (IntroReason, IntroAskUseful)
                | (IntroReason, Negotiating)
                | (IntroAskUseful, Negotiating)
                | (Negotiating, AwaitingConfirmation)
                | (AwaitingConfirmation, Negotiating)
                | (Negotiating, PriceConfirmed)
                | (AwaitingConfirmation, PriceConfirmed)
                | (PriceConfirmed, PaymentComplete)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepMachine {
    step: NegotiationStep,
}

impl StepMachine {
    pub fn new(step: NegotiationStep) -> Self {
        Self { step }
    }

    pub fn current(&self) -> NegotiationStep {
        self.step
    }

    /// Move to `to`, returning the previous step.
    pub fn transition(&mut self, to: NegotiationStep) -> Result<NegotiationStep, NegotiationError> {
        let from = self.step;
        if !from.can_transition(to) {
            return Err(NegotiationError::InvalidTransition { from, to });
        }
        if from != to {
            tracing::debug!(?from, ?to, "step transition");
        }
        self.step = to;
        Ok(from)
    }

    /// Set the step without validation (reload and server reconciliation).
    pub fn restore(&mut self, step: NegotiationStep) {
        self.step = step;
    }

    pub fn reset(&mut self) {
        self.step = NegotiationStep::None;
    }
}
