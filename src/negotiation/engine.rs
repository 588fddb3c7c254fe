use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::core::config::NegotiationConfig;
use crate::core::error::{NegotiationError, RemoteError};
use crate::core::message::{Message, MessageMeta};
use crate::core::remote::*;
use crate::core::session::{SessionRecord, SessionStatus, TrialStatus};
use crate::core::step::{NegotiationStep, StepMachine};
use crate::storage::{OwnerGuard, SessionStore, StoreChange};

use super::event::{EndReason, EngineEvent};
use super::flusher::MessageQueue;
use super::ownership::{ChangeVerdict, SessionOwnership};
use super::policy::OfferPolicy;
use super::resolver::{TurnEnvelope, TurnId, TurnResolver};
use super::script;
use super::sync::SyncScheduler;

/// Result of one remote request, carried back through the turn resolver.
#[derive(Debug)]
pub enum TurnOutcome {
    Intro(Result<IntroReply, RemoteError>),
    Negotiation(Result<NegotiationReply, RemoteError>),
    Confirmation {
        price_cents: u64,
        result: Result<PriceConfirmation, RemoteError>,
    },
    TrialStart(Result<TrialGrant, RemoteError>),
    FreeContinuation(Result<FreeContinuation, RemoteError>),
}

/// Something the engine has to react to.
#[derive(Debug)]
pub enum EngineInput {
    Reply(TurnEnvelope<TurnOutcome>),
    StoreChange(StoreChange),
    StoreLagged,
    /// Periodic re-read of the store, catching writes from other processes.
    StorePoll,
    Closed,
}

/// Mutable per-context flags.
#[derive(Debug)]
pub struct ContextState {
    pub ownership: SessionOwnership,
    /// Sticky for the life of the context.
    pub usage_limited: bool,
    /// Set when ownership is lost.
    pub ended: bool,
}

pub struct NegotiationEngine {
    ctx: ContextState,
    record: SessionRecord,
    steps: StepMachine,
    observed: Option<SessionRecord>,
    store: SessionStore,
    changes: broadcast::Receiver<StoreChange>,
    poll: tokio::time::Interval,
    /// Highest store revision already observed or written by this context.
    last_seen_revision: u64,
    service: Arc<dyn NegotiationService>,
    resolver: TurnResolver<TurnOutcome>,
    queue: MessageQueue,
    sync: SyncScheduler,
    policy: OfferPolicy,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl NegotiationEngine {
    pub fn new(
        config: &NegotiationConfig,
        context_id: String,
        store: SessionStore,
        service: Arc<dyn NegotiationService>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let changes = store.subscribe();
        let mut poll = tokio::time::interval(Duration::from_millis(config.store_poll_ms));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let sync = SyncScheduler::new(
            Arc::clone(&service),
            Duration::from_millis(config.sync_debounce_ms),
        );

        let engine = Self {
            ctx: ContextState {
                ownership: SessionOwnership::new(context_id.clone(), config.owner_timeout_secs),
                usage_limited: false,
                ended: false,
            },
            record: SessionRecord::blank(context_id),
            steps: StepMachine::default(),
            observed: None,
            store,
            changes,
            poll,
            last_seen_revision: 0,
            service,
            resolver: TurnResolver::new(),
            queue: MessageQueue::new(),
            sync,
            policy: OfferPolicy::from_config(config),
            events,
        };
        (engine, rx)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn step(&self) -> NegotiationStep {
        self.steps.current()
    }

    pub fn transcript(&self) -> &[Message] {
        &self.record.transcript
    }

    pub fn observed(&self) -> Option<&SessionRecord> {
        self.observed.as_ref()
    }

    pub fn context(&self) -> &ContextState {
        &self.ctx
    }

    pub fn is_owner(&self) -> bool {
        self.ctx.ownership.believes_owner()
    }

    pub fn has_ended(&self) -> bool {
        self.ctx.ended || self.ctx.usage_limited
    }

    pub fn pending_turns(&self) -> usize {
        self.resolver.in_flight()
    }

    pub fn buffered_turns(&self) -> usize {
        self.resolver.buffered()
    }

    // ---------------------------------------------------------------------
    // Startup
    // ---------------------------------------------------------------------

    /// Restore a session this context owns, or start observing one owned
    /// elsewhere, then reconcile with the server's view.
    pub async fn start(&mut self) -> Result<(), NegotiationError> {
        let (revision, stored) = self.store.load_with_revision().await?;
        self.last_seen_revision = revision;
        let context_id = self.ctx.ownership.context_id().to_string();

        match stored {
            Some(record) if record.is_active() && SessionOwnership::is_owner(&record, &context_id) => {
                tracing::info!(session = %record.session_id, step = ?record.step, "restoring session");
                self.ctx.ownership.confirm(&record.session_id, revision);
                self.adopt(record);
            }
            Some(record) if !self.ctx.ownership.can_claim(Some(&record), Utc::now()) => {
                tracing::info!(session = %record.session_id, owner = %record.owner_id, "observing session owned elsewhere");
                self.emit(EngineEvent::Observed {
                    session_id: record.session_id.clone(),
                    message: record.transcript.last().cloned(),
                });
                self.observed = Some(record);
                return Ok(());
            }
            _ => {}
        }

        self.reconcile().await
    }

    async fn reconcile(&mut self) -> Result<(), NegotiationError> {
        let status = match self.service.negotiation_status().await {
            Ok(status) => status,
            Err(RemoteError::UsageLimit) => {
                self.freeze_for_usage_limit().await?;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not fetch negotiation status");
                return Ok(());
            }
        };

        let has_state = status.confirmed_price.is_some()
            || status.is_paid()
            || status.offer_history.as_ref().is_some_and(|h| !h.is_empty())
            || status.negotiation_history.as_ref().is_some_and(|h| !h.is_empty())
            || status.trial_status.is_some_and(|t| t != TrialStatus::None);
        if !has_state {
            return Ok(());
        }

        if self.record.is_blank() && !self.ensure_owner().await? {
            return Ok(());
        }

        if let Some(history) = status.offer_history.as_deref() {
            if self.record.offer_history.is_empty() && !history.is_empty() {
                self.record.offer_history = self.policy.sanitize_history(history);
                self.record.current_offer_cents = self.record.last_offer();
            }
        }
        if let Some(trial) = status.trial_status {
            if self.record.trial_status == TrialStatus::None {
                self.record.trial_status = trial;
                self.record.trial_offer_cents = status.trial_offer_cents;
                self.record.trial_ends_at = status.trial_ends_at;
            }
        }
        if let Some(history) = status.negotiation_history.clone() {
            if self.record.transcript.is_empty() {
                self.record.transcript = history;
            }
        }
        if let Some(price) = status.confirmed_price {
            self.record.confirmed_offer_cents = Some(price);
            self.record.awaiting_confirmation = false;
            if status.payment_link.is_some() {
                self.record.payment_link = status.payment_link.clone();
            }
            if !matches!(
                self.steps.current(),
                NegotiationStep::PaymentComplete | NegotiationStep::Done
            ) {
                self.steps.restore(NegotiationStep::PriceConfirmed);
            }
        }
        if status.is_paid() {
            self.steps.restore(NegotiationStep::PaymentComplete);
            self.record.status = SessionStatus::Completed;
        } else if self.steps.current() == NegotiationStep::None
            && (!self.record.offer_history.is_empty() || !self.record.transcript.is_empty())
        {
            self.steps.restore(NegotiationStep::Negotiating);
        }
        self.record.step = self.steps.current();

        tracing::info!(step = ?self.record.step, "reconciled with server state");
        self.persist().await
    }

    // ---------------------------------------------------------------------
    // User operations
    // ---------------------------------------------------------------------

    /// Handle a user utterance. Returns once the request is dispatched; the
    /// reply is applied later through [`process_next`](Self::process_next).
    pub async fn submit(&mut self, utterance: &str) -> Result<(), NegotiationError> {
        let text = utterance.trim();
        if text.is_empty() {
            return Err(NegotiationError::EmptyInput);
        }
        self.check_live()?;
        if !self.record.is_blank() && !self.steps.current().accepts_negotiation_input() {
            return Err(NegotiationError::InputRejected(self.steps.current()));
        }
        if !self.ensure_owner().await? {
            return Err(NegotiationError::NotOwner);
        }
        if !self.steps.current().accepts_negotiation_input() {
            return Err(NegotiationError::InputRejected(self.steps.current()));
        }

        if self.steps.current() == NegotiationStep::None {
            self.transition(NegotiationStep::IntroReason);
        }
        self.append(Message::new_user(text.to_string()));

        let step = self.steps.current();
        let accepted = self.policy.accepts(
            text,
            self.record.awaiting_confirmation,
            self.record.current_offer_cents,
        );

        if step.is_intro() {
            self.dispatch_intro(text.to_string());
        } else if accepted && self.record.trial_status == TrialStatus::Offered {
            self.dispatch_trial_start();
        } else if let (true, Some(price)) = (accepted, self.record.current_offer_cents) {
            tracing::info!(price, "acceptance detected, confirming price");
            self.dispatch_confirmation(price);
        } else {
            if step == NegotiationStep::AwaitingConfirmation {
                self.record.awaiting_confirmation = false;
                self.transition(NegotiationStep::Negotiating);
            }
            self.dispatch_negotiation(text.to_string());
        }

        self.persist().await
    }

    pub async fn accept_trial(&mut self) -> Result<(), NegotiationError> {
        self.check_live()?;
        self.verify_ownership().await?;
        if self.record.trial_status != TrialStatus::Offered {
            return Err(NegotiationError::InputRejected(self.steps.current()));
        }
        self.dispatch_trial_start();
        Ok(())
    }

    pub async fn decline_trial(&mut self) -> Result<(), NegotiationError> {
        self.check_live()?;
        self.verify_ownership().await?;
        if self.record.trial_status != TrialStatus::Offered {
            return Err(NegotiationError::InputRejected(self.steps.current()));
        }

        self.record.trial_declined = true;
        self.record.trial_status = TrialStatus::None;
        self.record.trial_offer_cents = None;
        self.emit(EngineEvent::TrialChanged {
            status: TrialStatus::None,
            offer_cents: None,
        });
        self.queue
            .enqueue(&[script::TRIAL_DECLINED.to_string()], MessageMeta::default());
        self.flush();
        self.persist().await
    }

    /// Ask for the trial again after declining it.
    pub async fn request_trial(&mut self) -> Result<(), NegotiationError> {
        self.check_live()?;
        self.verify_ownership().await?;
        if self.record.trial_status != TrialStatus::None
            || self.record.current_offer_cents.is_none()
            || !self.steps.current().is_negotiating()
        {
            return Err(NegotiationError::InputRejected(self.steps.current()));
        }

        self.record.trial_declined = false;
        self.offer_trial_once();
        self.flush();
        self.persist().await
    }

    pub async fn continue_free(&mut self) -> Result<(), NegotiationError> {
        self.check_live()?;
        self.verify_ownership().await?;
        if self.record.trial_status != TrialStatus::Expired {
            return Err(NegotiationError::InputRejected(self.steps.current()));
        }
        let service = Arc::clone(&self.service);
        self.dispatch(async move { TurnOutcome::FreeContinuation(service.continue_free().await) });
        Ok(())
    }

    /// External signal that payment for the confirmed price went through.
    pub async fn payment_completed(&mut self) -> Result<(), NegotiationError> {
        self.check_live()?;
        self.verify_ownership().await?;
        if self.steps.current() != NegotiationStep::PriceConfirmed {
            return Err(NegotiationError::InputRejected(self.steps.current()));
        }

        self.transition(NegotiationStep::PaymentComplete);
        self.queue
            .enqueue(&[script::PAYMENT_COMPLETE.to_string()], MessageMeta::default().finalized());
        self.flush();
        self.conclude().await
    }

    /// Move an active trial past its end date to `expired`.
    pub async fn refresh_trial(&mut self, now: DateTime<Utc>) -> Result<bool, NegotiationError> {
        let expired = self.record.trial_status == TrialStatus::Active
            && self.record.trial_ends_at.is_some_and(|ends| ends <= now);
        if !expired {
            return Ok(false);
        }
        self.record.trial_status = TrialStatus::Expired;
        self.emit(EngineEvent::TrialChanged {
            status: TrialStatus::Expired,
            offer_cents: self.record.trial_offer_cents,
        });
        self.persist().await?;
        Ok(true)
    }

    /// Start over with a new session owned by this context, displacing any
    /// other owner.
    pub async fn restart(&mut self) -> Result<(), NegotiationError> {
        if self.ctx.usage_limited {
            return Err(NegotiationError::UsageLimitReached);
        }

        self.resolver.reset();
        self.queue.clear();
        let from = self.steps.current();
        let record = self.ctx.ownership.take_over();
        self.adopt(record);
        self.observed = None;
        self.ctx.ended = false;

        let revision = self.store.save(&self.record).await?;
        self.mark_seen(revision);
        self.ctx.ownership.confirm(&self.record.session_id, revision);
        tracing::info!(session = %self.record.session_id, "session restarted");
        if from != NegotiationStep::None {
            self.emit(EngineEvent::StepChanged {
                from,
                to: NegotiationStep::None,
            });
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.sync.shutdown();
    }

    // ---------------------------------------------------------------------
    // Input loop
    // ---------------------------------------------------------------------

    /// Wait for the next input. Store changes always win over replies that
    /// are ready at the same moment, so a takeover is seen before any reply
    /// could be applied or persisted.
    pub async fn wait_input(&mut self) -> EngineInput {
        tokio::select! {
            biased;
            change = self.changes.recv() => match change {
                Ok(change) => EngineInput::StoreChange(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "store notifications lagged");
                    EngineInput::StoreLagged
                }
                Err(broadcast::error::RecvError::Closed) => EngineInput::Closed,
            },
            _ = self.poll.tick() => EngineInput::StorePoll,
            reply = self.resolver.recv() => match reply {
                Some(envelope) => EngineInput::Reply(envelope),
                None => EngineInput::Closed,
            },
        }
    }

    pub async fn handle_input(&mut self, input: EngineInput) -> Result<(), NegotiationError> {
        match input {
            EngineInput::Reply(envelope) => {
                let ready = self.resolver.accept(envelope);
                if ready.is_empty() {
                    return Ok(());
                }
                if self.ctx.ownership.believes_owner() && !self.still_owner().await? {
                    tracing::debug!(dropped = ready.len(), "replies dropped after takeover");
                    return Ok(());
                }
                for (turn_id, outcome) in ready {
                    if self.resolver.is_cancelled() {
                        break;
                    }
                    self.apply(turn_id, outcome).await?;
                }
                Ok(())
            }
            EngineInput::StoreChange(change) => {
                self.on_store_change(change);
                Ok(())
            }
            EngineInput::StoreLagged | EngineInput::StorePoll => {
                let (revision, record) = self.store.load_with_revision().await?;
                if revision > self.last_seen_revision {
                    let change = StoreChange {
                        key: self.store.key().to_string(),
                        revision,
                        record,
                    };
                    self.on_store_change(change);
                }
                Ok(())
            }
            EngineInput::Closed => Ok(()),
        }
    }

    pub async fn process_next(&mut self) -> Result<(), NegotiationError> {
        let input = self.wait_input().await;
        self.handle_input(input).await
    }

    /// Process inputs until no turn is outstanding.
    pub async fn settle(&mut self) -> Result<(), NegotiationError> {
        while self.resolver.in_flight() > 0 {
            self.process_next().await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reply application
    // ---------------------------------------------------------------------

    async fn apply(&mut self, turn_id: TurnId, outcome: TurnOutcome) -> Result<(), NegotiationError> {
        tracing::debug!(turn_id, "applying turn");
        let mut concluded = false;

        match outcome {
            TurnOutcome::Intro(Ok(reply)) => {
                self.queue.enqueue(&reply.reply_parts, MessageMeta::default());
                match reply.next_step {
                    Some(next @ (NegotiationStep::IntroAskUseful | NegotiationStep::Negotiating)) => {
                        self.transition(next);
                    }
                    Some(other) => tracing::debug!(step = ?other, "ignoring intro step hint"),
                    None => {}
                }
                if reply.offer_trial == Some(true) {
                    self.offer_trial_once();
                }
            }
            TurnOutcome::Negotiation(Ok(reply)) => self.apply_negotiation_reply(reply),
            TurnOutcome::Confirmation {
                price_cents,
                result: Ok(confirmation),
            } => {
                let cents = confirmation.confirmed_price_cents;
                if cents != price_cents {
                    tracing::warn!(requested = price_cents, confirmed = cents, "server confirmed a different price");
                }
                self.record.confirmed_offer_cents = Some(cents);
                self.record.awaiting_confirmation = false;
                if confirmation.payment_link.is_some() {
                    self.record.payment_link = confirmation.payment_link.clone();
                }
                self.transition(NegotiationStep::PriceConfirmed);
                self.queue.enqueue_message(Message::new_assistant(
                    script::price_confirmed(cents, confirmation.payment_link.as_deref()),
                    MessageMeta::price(cents).finalized(),
                ));
                if let Some(url) = confirmation.payment_link {
                    self.emit(EngineEvent::PaymentLink { url });
                }
            }
            TurnOutcome::TrialStart(Ok(grant)) => {
                self.record.trial_status = grant.trial_status;
                self.record.trial_offer_cents = Some(grant.trial_offer_cents);
                self.record.trial_ends_at = Some(grant.trial_ends_at);
                self.queue.enqueue_message(Message::new_assistant(
                    script::trial_started(grant.trial_offer_cents, &grant.trial_ends_at),
                    MessageMeta::trial(grant.trial_offer_cents).finalized(),
                ));
                self.emit(EngineEvent::TrialChanged {
                    status: grant.trial_status,
                    offer_cents: Some(grant.trial_offer_cents),
                });
                self.transition(NegotiationStep::Done);
            }
            TurnOutcome::FreeContinuation(Ok(free)) => {
                self.record.trial_status = free.trial_status;
                self.queue
                    .enqueue(&[script::FREE_PLAN.to_string()], MessageMeta::default().finalized());
                self.emit(EngineEvent::TrialChanged {
                    status: free.trial_status,
                    offer_cents: self.record.trial_offer_cents,
                });
                concluded = true;
            }
            TurnOutcome::Intro(Err(e))
            | TurnOutcome::Negotiation(Err(e))
            | TurnOutcome::Confirmation { result: Err(e), .. }
            | TurnOutcome::TrialStart(Err(e))
            | TurnOutcome::FreeContinuation(Err(e))
                if e.is_usage_limit() =>
            {
                return self.freeze_for_usage_limit().await;
            }
            TurnOutcome::Intro(Err(e)) => {
                tracing::warn!(error = %e, "intro request failed, moving on to pricing");
                self.queue
                    .enqueue(&[script::INTRO_FALLBACK.to_string()], MessageMeta::default());
                self.transition(NegotiationStep::Negotiating);
            }
            TurnOutcome::Negotiation(Err(e)) => {
                tracing::warn!(error = %e, "negotiation request failed, using scripted reply");
                self.queue
                    .enqueue(&[script::NEGOTIATION_FALLBACK.to_string()], MessageMeta::default());
            }
            TurnOutcome::Confirmation { result: Err(e), .. } => {
                tracing::warn!(error = %e, "price confirmation failed");
                self.queue
                    .enqueue(&[script::CONFIRM_FAILED.to_string()], MessageMeta::default());
            }
            TurnOutcome::TrialStart(Err(e)) => {
                tracing::warn!(error = %e, "trial start failed");
                self.queue
                    .enqueue(&[script::TRIAL_FAILED.to_string()], MessageMeta::default());
            }
            TurnOutcome::FreeContinuation(Err(e)) => {
                tracing::warn!(error = %e, "continue-free failed");
                self.queue
                    .enqueue(&[script::CONTINUE_FREE_FAILED.to_string()], MessageMeta::default());
            }
        }

        self.flush();
        if concluded {
            self.conclude().await
        } else {
            self.persist().await
        }
    }

    fn apply_negotiation_reply(&mut self, reply: NegotiationReply) {
        // A reply that lands after the price was confirmed or the session
        // ended is shown, but cannot reopen pricing.
        let settled = self.steps.current().is_terminal();
        if settled {
            tracing::debug!(step = ?self.steps.current(), "late negotiation reply, offer ignored");
        }
        let suppressed = settled || self.record.trial_status.suppresses_offers();
        let mut meta = MessageMeta::default();
        let mut trigger_trial = false;

        if let Some(price) = reply.suggested_price_cents {
            if suppressed {
                tracing::debug!(price, "price offer held back while a trial is pending");
            } else {
                let decision = self.policy.record_offer(&mut self.record, price);
                meta = MessageMeta::price(decision.applied_cents);
                trigger_trial = decision.trigger_trial;
                self.emit(EngineEvent::OfferUpdated {
                    cents: decision.applied_cents,
                });
            }
        }

        if reply.ask_confirmation == Some(true)
            && !suppressed
            && self.record.current_offer_cents.is_some()
            && self.transition(NegotiationStep::AwaitingConfirmation)
        {
            self.record.awaiting_confirmation = true;
        }

        self.queue.enqueue(&reply.reply_parts, meta);

        if !settled && (trigger_trial || reply.offer_trial == Some(true)) {
            self.offer_trial_once();
        }
    }

    fn offer_trial_once(&mut self) {
        if !self.policy.trial_allowed(&self.record) {
            tracing::debug!(status = ?self.record.trial_status, "trial already offered or declined");
            return;
        }
        let cents = self.policy.mark_trial_offered(&mut self.record);
        if self.record.awaiting_confirmation {
            self.record.awaiting_confirmation = false;
            self.transition(NegotiationStep::Negotiating);
        }
        tracing::info!(cents, "offering trial");
        self.queue.enqueue_message(Message::new_assistant(
            script::trial_offer(cents),
            MessageMeta::trial(cents).finalized(),
        ));
        self.emit(EngineEvent::TrialChanged {
            status: TrialStatus::Offered,
            offer_cents: Some(cents),
        });
    }

    // ---------------------------------------------------------------------
    // Ownership and termination
    // ---------------------------------------------------------------------

    fn on_store_change(&mut self, change: StoreChange) {
        if change.key != self.store.key() || change.revision <= self.last_seen_revision {
            return;
        }
        self.last_seen_revision = change.revision;
        match self.ctx.ownership.observe(&change) {
            ChangeVerdict::Ignore => {}
            ChangeVerdict::Mirror(record) => {
                self.emit(EngineEvent::Observed {
                    session_id: record.session_id.clone(),
                    message: record.transcript.last().cloned(),
                });
                self.observed = Some(record);
            }
            ChangeVerdict::Invalidate => self.lose_ownership(),
        }
    }

    /// Another context took the session: stop all effects and never write
    /// again.
    fn lose_ownership(&mut self) {
        self.ctx.ownership.invalidate();
        self.ctx.ended = true;
        self.resolver.cancel();
        self.queue.clear();
        self.sync.shutdown();
        self.transition(NegotiationStep::Done);
        self.append(Message::new_assistant(
            script::CHAT_ENDED.to_string(),
            MessageMeta::default().finalized(),
        ));
        self.emit(EngineEvent::SessionEnded {
            reason: EndReason::OwnershipLost,
        });
    }

    async fn freeze_for_usage_limit(&mut self) -> Result<(), NegotiationError> {
        if self.ctx.usage_limited {
            return Ok(());
        }
        tracing::warn!("usage limit reached, freezing session");
        self.ctx.usage_limited = true;
        self.resolver.cancel();
        self.queue.clear();
        self.sync.shutdown();
        self.transition(NegotiationStep::Done);
        self.queue.enqueue_message(Message::new_assistant(
            script::LIMIT_REACHED.to_string(),
            MessageMeta::default().finalized(),
        ));
        self.flush();
        self.emit(EngineEvent::SessionEnded {
            reason: EndReason::UsageLimit,
        });
        self.persist().await
    }

    async fn conclude(&mut self) -> Result<(), NegotiationError> {
        if !self.ctx.ownership.believes_owner() {
            return Ok(());
        }
        self.record.status = SessionStatus::Completed;
        self.record.step = self.steps.current();
        self.sync.publish(self.sync_snapshot());
        self.sync.run_sync();

        let guard = OwnerGuard {
            owner_id: self.ctx.ownership.context_id(),
            session_id: &self.record.session_id,
        };
        let cleared = self.store.clear_owned(guard).await?;
        if !cleared {
            tracing::info!(session = %self.record.session_id, "stored record already replaced, left in place");
        }
        self.ctx.ownership.release();
        tracing::info!(session = %self.record.session_id, "negotiation concluded");
        self.emit(EngineEvent::SessionEnded {
            reason: EndReason::Concluded,
        });
        Ok(())
    }

    fn check_live(&self) -> Result<(), NegotiationError> {
        if self.ctx.usage_limited {
            return Err(NegotiationError::UsageLimitReached);
        }
        if self.ctx.ended || self.ctx.ownership.is_invalidated() {
            return Err(NegotiationError::SessionEnded);
        }
        Ok(())
    }

    /// Claim the session if this context does not hold it yet; if it does,
    /// make sure nobody replaced it behind our back. Returns `false` when
    /// another context owns it.
    async fn ensure_owner(&mut self) -> Result<bool, NegotiationError> {
        if self.ctx.ownership.believes_owner() {
            self.verify_ownership().await?;
            return Ok(true);
        }

        let existing = self.store.load().await?;
        match self.ctx.ownership.claim(existing.as_ref(), Utc::now()) {
            Some(record) => {
                self.adopt(record);
                self.record.touch();
                let revision = self.store.save(&self.record).await?;
                self.mark_seen(revision);
                self.ctx.ownership.confirm(&self.record.session_id, revision);
                self.observed = None;
                tracing::info!(session = %self.record.session_id, "session claimed");
                Ok(true)
            }
            None => {
                self.observed = existing;
                Ok(false)
            }
        }
    }

    async fn verify_ownership(&mut self) -> Result<(), NegotiationError> {
        if !self.ctx.ownership.believes_owner() {
            return Err(NegotiationError::NotOwner);
        }
        if !self.still_owner().await? {
            return Err(NegotiationError::SessionEnded);
        }
        Ok(())
    }

    /// Re-read the store and give the session up if another context now
    /// holds it. This catches writes from other processes that the
    /// in-process change bus never sees.
    async fn still_owner(&mut self) -> Result<bool, NegotiationError> {
        let (revision, stored) = self.store.load_with_revision().await?;
        let Some(record) = stored else {
            return Ok(true);
        };
        let same_session = self.ctx.ownership.owned_session() == Some(record.session_id.as_str());
        if same_session && SessionOwnership::is_owner(&record, self.ctx.ownership.context_id()) {
            return Ok(true);
        }
        tracing::info!(owner = %record.owner_id, session = %record.session_id, "session taken over elsewhere");
        self.mark_seen(revision);
        self.lose_ownership();
        Ok(false)
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn mark_seen(&mut self, revision: u64) {
        self.last_seen_revision = self.last_seen_revision.max(revision);
    }

    fn adopt(&mut self, record: SessionRecord) {
        self.steps.restore(record.step);
        self.record = record;
    }

    fn transition(&mut self, to: NegotiationStep) -> bool {
        match self.steps.transition(to) {
            Ok(from) => {
                self.record.step = to;
                if from != to {
                    self.emit(EngineEvent::StepChanged { from, to });
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring transition");
                false
            }
        }
    }

    fn append(&mut self, message: Message) {
        self.record.transcript.push(message.clone());
        self.emit(EngineEvent::MessageAppended { message });
    }

    fn flush(&mut self) {
        for message in self.queue.flush(&mut self.record.transcript) {
            self.emit(EngineEvent::MessageAppended { message });
        }
    }

    async fn persist(&mut self) -> Result<(), NegotiationError> {
        if !self.ctx.ownership.believes_owner() || self.record.is_blank() {
            return Ok(());
        }
        self.record.step = self.steps.current();
        self.record.touch();

        let guard = OwnerGuard {
            owner_id: self.ctx.ownership.context_id(),
            session_id: &self.record.session_id,
        };
        let saved = self.store.save_owned(&self.record, guard).await?;
        match saved {
            Some(revision) => self.mark_seen(revision),
            None => {
                self.lose_ownership();
                return Ok(());
            }
        }

        if !self.ctx.usage_limited {
            self.sync.publish(self.sync_snapshot());
            self.sync.schedule_sync();
        }
        Ok(())
    }

    fn sync_snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            transcript: self.record.transcript.clone(),
            offer_history: self.record.offer_history.clone(),
            trial_status: self.record.trial_status,
            trial_offer_cents: self.record.trial_offer_cents,
        }
    }

    fn negotiation_meta(&self, latest_utterance: String) -> NegotiationMeta {
        NegotiationMeta {
            current_offer_cents: self.record.current_offer_cents,
            offer_history: self.record.offer_history.clone(),
            awaiting_confirmation: self.record.awaiting_confirmation,
            trial_status: self.record.trial_status,
            trial_declined: self.record.trial_declined,
            latest_utterance,
        }
    }

    fn dispatch<F>(&mut self, request: F)
    where
        F: std::future::Future<Output = TurnOutcome> + Send + 'static,
    {
        if self.resolver.dispatch(request).is_none() {
            tracing::debug!("dispatch suppressed, resolver cancelled");
        }
    }

    fn dispatch_intro(&mut self, utterance: String) {
        let req = IntroRequest {
            transcript: self.record.transcript.clone(),
            step: self.steps.current(),
            latest_utterance: utterance,
        };
        let service = Arc::clone(&self.service);
        self.dispatch(async move { TurnOutcome::Intro(service.intro_step(req).await) });
    }

    fn dispatch_negotiation(&mut self, utterance: String) {
        let req = NegotiationRequest {
            transcript: self.record.transcript.clone(),
            meta: self.negotiation_meta(utterance),
        };
        let service = Arc::clone(&self.service);
        self.dispatch(async move { TurnOutcome::Negotiation(service.negotiation_step(req).await) });
    }

    fn dispatch_confirmation(&mut self, price_cents: u64) {
        let service = Arc::clone(&self.service);
        self.dispatch(async move {
            TurnOutcome::Confirmation {
                price_cents,
                result: service.confirm_price(price_cents).await,
            }
        });
    }

    fn dispatch_trial_start(&mut self) {
        let cents = self
            .record
            .trial_offer_cents
            .unwrap_or(self.policy.min_price_cents());
        let req = TrialRequest {
            trial_offer_cents: cents,
            transcript: self.record.transcript.clone(),
            offer_meta: self.negotiation_meta(String::new()),
        };
        let service = Arc::clone(&self.service);
        self.dispatch(async move { TurnOutcome::TrialStart(service.start_trial(req).await) });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}
