#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::{mpsc, Semaphore};

    use crate::core::config::{AppConfig, NegotiationConfig};
    use crate::core::error::{NegotiationError, RemoteError};
    use crate::core::message::{Message, MessageRole};
    use crate::core::remote::*;
    use crate::core::session::{SessionRecord, TrialStatus};
    use crate::core::step::NegotiationStep;
    use crate::negotiation::script;
    use crate::negotiation::{EndReason, EngineEvent, NegotiationEngine};
    use crate::storage::{Database, SessionStore};

    const KEY: &str = "negotiation_session";

    #[derive(Default)]
    struct MockService {
        intro_error: Mutex<Option<RemoteError>>,
        scripted: Mutex<VecDeque<Result<NegotiationReply, RemoteError>>>,
        keyed: Mutex<HashMap<String, NegotiationReply>>,
        gates: Mutex<HashMap<String, Arc<Semaphore>>>,
        confirm: Mutex<VecDeque<Result<PriceConfirmation, RemoteError>>>,
        status: Mutex<Option<NegotiationStatus>>,
        negotiation_calls: AtomicUsize,
        sync_calls: AtomicUsize,
    }

    impl MockService {
        fn script(&self, reply: Result<NegotiationReply, RemoteError>) {
            self.scripted.lock().unwrap().push_back(reply);
        }

        fn gate(&self, utterance: &str) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            self.gates
                .lock()
                .unwrap()
                .insert(utterance.to_string(), Arc::clone(&gate));
            gate
        }
    }

    #[async_trait]
    impl NegotiationService for MockService {
        async fn intro_step(&self, _req: IntroRequest) -> Result<IntroReply, RemoteError> {
            if let Some(e) = self.intro_error.lock().unwrap().clone() {
                return Err(e);
            }
            Ok(IntroReply {
                reply_parts: vec!["Thanks! Let's find a price.".into()],
                next_step: Some(NegotiationStep::Negotiating),
                offer_trial: None,
            })
        }

        async fn negotiation_step(
            &self,
            req: NegotiationRequest,
        ) -> Result<NegotiationReply, RemoteError> {
            self.negotiation_calls.fetch_add(1, Ordering::SeqCst);
            let utterance = req.meta.latest_utterance.clone();
            let gate = self.gates.lock().unwrap().get(&utterance).cloned();
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            if let Some(reply) = self.keyed.lock().unwrap().remove(&utterance) {
                return Ok(reply);
            }
            self.scripted
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(reply(&["Let me think about that."], None)))
        }

        async fn confirm_price(&self, price_cents: u64) -> Result<PriceConfirmation, RemoteError> {
            self.confirm.lock().unwrap().pop_front().unwrap_or(Ok(PriceConfirmation {
                confirmed_price_cents: price_cents,
                payment_link: None,
            }))
        }

        async fn start_trial(&self, req: TrialRequest) -> Result<TrialGrant, RemoteError> {
            Ok(TrialGrant {
                trial_status: TrialStatus::Active,
                trial_offer_cents: req.trial_offer_cents,
                trial_ends_at: Utc::now() + Duration::days(14),
            })
        }

        async fn continue_free(&self) -> Result<FreeContinuation, RemoteError> {
            Ok(FreeContinuation {
                trial_status: TrialStatus::ExpiredFree,
            })
        }

        async fn negotiation_status(&self) -> Result<NegotiationStatus, RemoteError> {
            Ok(self.status.lock().unwrap().clone().unwrap_or_default())
        }

        async fn sync_state(&self, _snapshot: SyncSnapshot) -> Result<(), RemoteError> {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn reply(parts: &[&str], price: Option<u64>) -> NegotiationReply {
        NegotiationReply {
            reply_parts: parts.iter().map(|p| p.to_string()).collect(),
            suggested_price_cents: price,
            ask_confirmation: None,
            offer_trial: None,
        }
    }

    /// Open the database under `dir`. Two handles on one directory behave
    /// like two processes: they share the file but not the change bus.
    async fn open_at(dir: &std::path::Path) -> Database {
        let config = AppConfig {
            working_dir: dir.to_path_buf(),
            data_dir: "data".into(),
            ..Default::default()
        };
        let db = Database::open(&config).await.unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    async fn test_db() -> (Database, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let db = open_at(tmp.path()).await;
        (db, tmp)
    }

    fn engine(
        store: SessionStore,
        service: Arc<MockService>,
        context: &str,
    ) -> (NegotiationEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let config = NegotiationConfig::default();
        NegotiationEngine::new(&config, context.to_string(), store, service)
    }

    /// Engine past the intro, in the negotiating step.
    async fn negotiating_engine(
        store: SessionStore,
        service: Arc<MockService>,
        context: &str,
    ) -> (NegotiationEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (mut engine, events) = engine(store, service, context);
        engine.start().await.unwrap();
        engine.submit("I want to track my habits").await.unwrap();
        engine.settle().await.unwrap();
        assert_eq!(engine.step(), NegotiationStep::Negotiating);
        (engine, events)
    }

    fn texts(transcript: &[Message]) -> Vec<&str> {
        transcript.iter().map(|m| m.text.as_str()).collect()
    }

    fn trial_messages(transcript: &[Message]) -> usize {
        transcript.iter().filter(|m| m.is_trial_offer()).count()
    }

    #[tokio::test]
    async fn test_intro_moves_to_negotiating_and_persists() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let store = db.session_store(KEY);
        let (engine, _events) = negotiating_engine(store.clone(), service, "tab-a").await;

        let stored = store.load().await.unwrap().expect("session persisted");
        assert_eq!(stored.owner_id, "tab-a");
        assert_eq!(stored.step, NegotiationStep::Negotiating);
        assert_eq!(stored.transcript, engine.transcript());
        assert_eq!(
            texts(engine.transcript()),
            vec!["I want to track my habits", "Thanks! Let's find a price."]
        );
    }

    #[tokio::test]
    async fn test_intro_failure_falls_back_to_negotiating() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        *service.intro_error.lock().unwrap() = Some(RemoteError::Http("offline".into()));
        let (mut engine, _events) = engine(db.session_store(KEY), service, "tab-a");

        engine.start().await.unwrap();
        engine.submit("hello").await.unwrap();
        engine.settle().await.unwrap();

        assert_eq!(engine.step(), NegotiationStep::Negotiating);
        assert_eq!(engine.transcript().last().unwrap().text, script::INTRO_FALLBACK);
    }

    #[tokio::test]
    async fn test_replies_apply_in_dispatch_order() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let (mut engine, _events) =
            negotiating_engine(db.session_store(KEY), service.clone(), "tab-a").await;

        service
            .keyed
            .lock()
            .unwrap()
            .insert("first".into(), reply(&["Reply one"], Some(9_000)));
        service
            .keyed
            .lock()
            .unwrap()
            .insert("second".into(), reply(&["Reply two"], Some(8_000)));
        let first = service.gate("first");
        let second = service.gate("second");

        engine.submit("first").await.unwrap();
        engine.submit("second").await.unwrap();
        assert_eq!(engine.pending_turns(), 2);

        // Second reply arrives first and must wait.
        second.add_permits(1);
        while engine.buffered_turns() == 0 {
            engine.process_next().await.unwrap();
        }
        assert!(!texts(engine.transcript()).contains(&"Reply two"));
        assert!(engine.record().offer_history.is_empty());

        first.add_permits(1);
        engine.settle().await.unwrap();

        let tail: Vec<&str> = texts(engine.transcript()).into_iter().skip(2).collect();
        assert_eq!(tail, vec!["first", "second", "Reply one", "Reply two"]);
        assert_eq!(engine.record().offer_history, vec![9_000, 8_000]);
        assert_eq!(engine.record().current_offer_cents, Some(8_000));
    }

    #[tokio::test]
    async fn test_observer_cannot_submit_and_restart_takes_over() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let store = db.session_store(KEY);

        let (mut a, mut a_events) =
            negotiating_engine(store.clone(), service.clone(), "tab-a").await;

        let (mut b, _b_events) = engine(store.clone(), service.clone(), "tab-b");
        b.start().await.unwrap();
        assert!(!b.is_owner());
        assert_eq!(b.observed().unwrap().owner_id, "tab-a");
        assert!(matches!(
            b.submit("let me in").await,
            Err(NegotiationError::NotOwner)
        ));
        assert_eq!(service.negotiation_calls.load(Ordering::SeqCst), 0);

        // A has a turn in flight when B takes over.
        let gate = service.gate("slow");
        a.submit("slow").await.unwrap();

        b.restart().await.unwrap();
        assert!(b.is_owner());

        while !a.has_ended() {
            a.process_next().await.unwrap();
        }
        assert_eq!(a.pending_turns(), 0);
        assert_eq!(a.transcript().last().unwrap().text, script::CHAT_ENDED);
        assert!(matches!(
            a.submit("still here?").await,
            Err(NegotiationError::SessionEnded)
        ));

        let mut ended = false;
        while let Ok(event) = a_events.try_recv() {
            if let EngineEvent::SessionEnded { reason } = event {
                assert_eq!(reason, EndReason::OwnershipLost);
                ended = true;
            }
        }
        assert!(ended);

        // The late reply never reaches the store.
        gate.add_permits(1);
        tokio::task::yield_now().await;
        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.owner_id, "tab-b");
        assert_eq!(stored.session_id, b.record().session_id);
        assert!(stored.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_takeover_from_another_process_drops_late_reply() {
        let (db, tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let (mut a, _a_events) =
            negotiating_engine(db.session_store(KEY), service.clone(), "tab-a").await;

        let other = open_at(tmp.path()).await;
        let other_store = other.session_store(KEY);
        let (mut b, _b_events) = engine(other_store.clone(), service.clone(), "tab-b");
        b.start().await.unwrap();
        assert!(!b.is_owner());

        service
            .keyed
            .lock()
            .unwrap()
            .insert("slow".into(), reply(&["Too late for this."], Some(5_000)));
        let gate = service.gate("slow");
        a.submit("slow").await.unwrap();

        b.restart().await.unwrap();
        gate.add_permits(1);
        a.settle().await.unwrap();

        assert!(a.has_ended());
        assert!(!a.is_owner());
        assert!(!texts(a.transcript()).contains(&"Too late for this."));
        assert!(a.record().offer_history.is_empty());

        let stored = other_store.load().await.unwrap().unwrap();
        assert_eq!(stored.owner_id, "tab-b");
        assert_eq!(stored.session_id, b.record().session_id);
        assert!(stored.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_idle_owner_notices_takeover_from_another_process() {
        let (db, tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let (mut a, _a_events) =
            negotiating_engine(db.session_store(KEY), service.clone(), "tab-a").await;

        let other = open_at(tmp.path()).await;
        let (mut b, _b_events) = engine(other.session_store(KEY), service.clone(), "tab-b");
        b.start().await.unwrap();
        b.restart().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !a.has_ended() {
                a.process_next().await.unwrap();
            }
        })
        .await
        .expect("takeover should be noticed by polling");

        assert_eq!(a.transcript().last().unwrap().text, script::CHAT_ENDED);
        assert!(matches!(
            a.submit("hello?").await,
            Err(NegotiationError::SessionEnded)
        ));
    }

    #[tokio::test]
    async fn test_takeover_wins_over_reply_ready_at_same_time() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let store = db.session_store(KEY);
        let (mut a, _a_events) =
            negotiating_engine(store.clone(), service.clone(), "tab-a").await;
        let (mut b, _b_events) = engine(store.clone(), service.clone(), "tab-b");
        b.start().await.unwrap();

        service
            .keyed
            .lock()
            .unwrap()
            .insert("slow".into(), reply(&["Too late for this."], Some(5_000)));
        let gate = service.gate("slow");
        a.submit("slow").await.unwrap();

        // The reply is waiting in the channel before the takeover lands.
        gate.add_permits(1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        b.restart().await.unwrap();

        while !a.has_ended() {
            a.process_next().await.unwrap();
        }

        assert!(!texts(a.transcript()).contains(&"Too late for this."));
        assert!(a.record().offer_history.is_empty());
        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.owner_id, "tab-b");
        assert!(stored.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_six_rejections_offer_one_trial() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let (mut engine, _events) =
            negotiating_engine(db.session_store(KEY), service.clone(), "tab-a").await;

        for price in [10_000, 9_000, 8_000, 7_000, 6_000, 5_000] {
            service.script(Ok(reply(&["How about this?"], Some(price))));
        }
        for _ in 0..6 {
            engine.submit("too expensive").await.unwrap();
            engine.settle().await.unwrap();
        }

        let record = engine.record();
        assert_eq!(record.offer_history, vec![10_000, 9_000, 8_000, 7_000, 6_000, 5_000]);
        assert_eq!(record.trial_status, TrialStatus::Offered);
        assert_eq!(record.trial_offer_cents, Some(5_000));
        assert_eq!(trial_messages(engine.transcript()), 1);

        // Further prices are held back while the trial is on the table.
        let mut seventh = reply(&["Still thinking of you."], Some(4_000));
        seventh.offer_trial = Some(true);
        service.script(Ok(seventh));
        engine.submit("still too expensive").await.unwrap();
        engine.settle().await.unwrap();

        assert_eq!(engine.record().offer_history.len(), 6);
        let last = engine.transcript().last().unwrap();
        assert_eq!(last.text, "Still thinking of you.");
        assert_eq!(last.offer_cents(), None);
        assert_eq!(trial_messages(engine.transcript()), 1);

        engine.decline_trial().await.unwrap();
        assert_eq!(engine.record().trial_status, TrialStatus::None);
        assert!(engine.record().trial_declined);

        service.script(Ok(reply(&["Fine, lower then."], Some(4_500))));
        engine.submit("no thanks, cheaper please").await.unwrap();
        engine.settle().await.unwrap();

        assert_eq!(engine.record().offer_history.last(), Some(&4_500));
        assert_eq!(engine.record().trial_status, TrialStatus::None);
        assert_eq!(trial_messages(engine.transcript()), 1);

        // Asking again puts the trial back on the table at the new low.
        engine.request_trial().await.unwrap();
        assert_eq!(engine.record().trial_status, TrialStatus::Offered);
        assert_eq!(engine.record().trial_offer_cents, Some(4_500));
        assert!(!engine.record().trial_declined);
        assert_eq!(trial_messages(engine.transcript()), 2);
        assert!(matches!(
            engine.request_trial().await,
            Err(NegotiationError::InputRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_accepting_trial_ends_negotiation() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let (mut engine, _events) =
            negotiating_engine(db.session_store(KEY), service.clone(), "tab-a").await;

        let mut offer = reply(&["Here's an idea."], Some(6_000));
        offer.offer_trial = Some(true);
        service.script(Ok(offer));
        engine.submit("too pricey for me").await.unwrap();
        engine.settle().await.unwrap();
        assert_eq!(engine.record().trial_status, TrialStatus::Offered);

        engine.accept_trial().await.unwrap();
        engine.settle().await.unwrap();

        assert_eq!(engine.record().trial_status, TrialStatus::Active);
        assert_eq!(engine.record().trial_offer_cents, Some(6_000));
        assert_eq!(engine.step(), NegotiationStep::Done);

        let expired = engine
            .refresh_trial(Utc::now() + Duration::days(30))
            .await
            .unwrap();
        assert!(expired);
        assert_eq!(engine.record().trial_status, TrialStatus::Expired);

        engine.continue_free().await.unwrap();
        engine.settle().await.unwrap();
        assert_eq!(engine.transcript().last().unwrap().text, script::FREE_PLAN);
    }

    #[tokio::test]
    async fn test_usage_limit_freezes_session() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let store = db.session_store(KEY);
        let (mut engine, mut events) =
            negotiating_engine(store.clone(), service.clone(), "tab-a").await;

        service.script(Err(RemoteError::UsageLimit));
        engine.submit("what's the price?").await.unwrap();
        engine.settle().await.unwrap();

        assert!(engine.context().usage_limited);
        assert!(engine.has_ended());
        assert_eq!(engine.step(), NegotiationStep::Done);
        assert_eq!(engine.transcript().last().unwrap().text, script::LIMIT_REACHED);

        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.step, NegotiationStep::Done);

        assert!(matches!(
            engine.submit("hello?").await,
            Err(NegotiationError::UsageLimitReached)
        ));
        assert!(matches!(
            engine.restart().await,
            Err(NegotiationError::UsageLimitReached)
        ));

        let mut limit_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                EngineEvent::SessionEnded {
                    reason: EndReason::UsageLimit
                }
            ) {
                limit_events += 1;
            }
        }
        assert_eq!(limit_events, 1);
    }

    #[tokio::test]
    async fn test_confirmation_failure_keeps_step() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let store = db.session_store(KEY);
        let (mut engine, _events) =
            negotiating_engine(store.clone(), service.clone(), "tab-a").await;

        let mut ask = reply(&["Would $80 work?"], Some(8_000));
        ask.ask_confirmation = Some(true);
        service.script(Ok(ask));
        engine.submit("what can you do?").await.unwrap();
        engine.settle().await.unwrap();
        assert_eq!(engine.step(), NegotiationStep::AwaitingConfirmation);

        service.confirm.lock().unwrap().push_back(Err(RemoteError::Api {
            status: 500,
            message: "boom".into(),
        }));
        engine.submit("yes").await.unwrap();
        engine.settle().await.unwrap();
        assert_eq!(engine.step(), NegotiationStep::AwaitingConfirmation);
        assert_eq!(engine.transcript().last().unwrap().text, script::CONFIRM_FAILED);
        assert_eq!(engine.record().confirmed_offer_cents, None);

        service.confirm.lock().unwrap().push_back(Ok(PriceConfirmation {
            confirmed_price_cents: 8_000,
            payment_link: Some("https://pay.example/abc".into()),
        }));
        engine.submit("yes").await.unwrap();
        engine.settle().await.unwrap();
        assert_eq!(engine.step(), NegotiationStep::PriceConfirmed);
        assert_eq!(engine.record().confirmed_offer_cents, Some(8_000));
        assert_eq!(
            engine.record().payment_link.as_deref(),
            Some("https://pay.example/abc")
        );

        assert!(matches!(
            engine.submit("actually less?").await,
            Err(NegotiationError::InputRejected(NegotiationStep::PriceConfirmed))
        ));

        engine.payment_completed().await.unwrap();
        assert_eq!(engine.step(), NegotiationStep::PaymentComplete);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reply_after_confirmation_keeps_price() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let store = db.session_store(KEY);
        let (mut engine, _events) =
            negotiating_engine(store.clone(), service.clone(), "tab-a").await;

        let mut ask = reply(&["Would $80 work?"], Some(8_000));
        ask.ask_confirmation = Some(true);
        service.script(Ok(ask));
        engine.submit("what can you do?").await.unwrap();
        engine.settle().await.unwrap();
        assert_eq!(engine.step(), NegotiationStep::AwaitingConfirmation);

        // The confirmation is dispatched first, so it lands before this reply.
        let mut late = reply(&["It does, and I could go to $60."], Some(6_000));
        late.ask_confirmation = Some(true);
        late.offer_trial = Some(true);
        service
            .keyed
            .lock()
            .unwrap()
            .insert("does it include sync?".into(), late);
        engine.submit("yes").await.unwrap();
        engine.submit("does it include sync?").await.unwrap();
        engine.settle().await.unwrap();

        assert_eq!(engine.step(), NegotiationStep::PriceConfirmed);
        assert_eq!(engine.record().confirmed_offer_cents, Some(8_000));
        assert_eq!(engine.record().offer_history, vec![8_000]);
        assert_eq!(engine.record().current_offer_cents, Some(8_000));
        assert!(!engine.record().awaiting_confirmation);
        assert_eq!(engine.record().trial_status, TrialStatus::None);

        let last = engine.transcript().last().unwrap();
        assert_eq!(last.text, "It does, and I could go to $60.");
        assert_eq!(last.offer_cents(), None);

        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.offer_history, vec![8_000]);
        assert_eq!(stored.step, NegotiationStep::PriceConfirmed);
    }

    #[tokio::test]
    async fn test_counter_offer_is_not_acceptance() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let (mut engine, _events) =
            negotiating_engine(db.session_store(KEY), service.clone(), "tab-a").await;

        let mut ask = reply(&["Would $80 work?"], Some(8_000));
        ask.ask_confirmation = Some(true);
        service.script(Ok(ask));
        engine.submit("what can you do?").await.unwrap();
        engine.settle().await.unwrap();

        engine.submit("no but what about $70").await.unwrap();
        assert_eq!(engine.step(), NegotiationStep::Negotiating);
        assert!(!engine.record().awaiting_confirmation);
        engine.settle().await.unwrap();
        assert_eq!(engine.record().confirmed_offer_cents, None);
    }

    #[tokio::test]
    async fn test_restores_own_session_after_reload() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let store = db.session_store(KEY);

        let transcript = {
            let (mut engine, _events) =
                negotiating_engine(store.clone(), service.clone(), "tab-a").await;
            service.script(Ok(reply(&["How about $90?"], Some(9_000))));
            engine.submit("too much").await.unwrap();
            engine.settle().await.unwrap();
            engine.shutdown();
            let transcript = engine.transcript().to_vec();
            transcript
        };

        let (mut engine, _events) = engine(store, service, "tab-a");
        engine.start().await.unwrap();
        assert!(engine.is_owner());
        assert_eq!(engine.step(), NegotiationStep::Negotiating);
        assert_eq!(engine.record().offer_history, vec![9_000]);
        assert_eq!(engine.transcript(), transcript.as_slice());
    }

    #[tokio::test]
    async fn test_reconciles_confirmed_price_from_server() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        *service.status.lock().unwrap() = Some(NegotiationStatus {
            confirmed_price: Some(7_000),
            payment_link: Some("https://pay.example/xyz".into()),
            offer_history: Some(vec![10_000, 7_000]),
            ..Default::default()
        });
        let store = db.session_store(KEY);
        let (mut engine, _events) = engine(store.clone(), service, "tab-a");

        engine.start().await.unwrap();

        assert!(engine.is_owner());
        assert_eq!(engine.step(), NegotiationStep::PriceConfirmed);
        assert_eq!(engine.record().confirmed_offer_cents, Some(7_000));
        assert_eq!(engine.record().offer_history, vec![10_000, 7_000]);
        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.step, NegotiationStep::PriceConfirmed);
    }

    #[tokio::test]
    async fn test_claims_session_from_silent_owner() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let store = db.session_store(KEY);

        let mut abandoned = SessionRecord::new("tab-a".into());
        abandoned.updated_at = Utc::now() - Duration::hours(2);
        store.save(&abandoned).await.unwrap();

        let (mut engine, _events) = engine(store.clone(), service, "tab-b");
        engine.start().await.unwrap();
        assert!(engine.observed().is_none());

        engine.submit("hi there").await.unwrap();
        engine.settle().await.unwrap();

        assert!(engine.is_owner());
        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.owner_id, "tab-b");
        assert_ne!(stored.session_id, abandoned.session_id);
        assert_eq!(stored.transcript[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let (db, _tmp) = test_db().await;
        let service = Arc::new(MockService::default());
        let (mut engine, _events) = engine(db.session_store(KEY), service, "tab-a");
        engine.start().await.unwrap();
        assert!(matches!(
            engine.submit("   ").await,
            Err(NegotiationError::EmptyInput)
        ));
        assert!(engine.record().is_blank());
    }
}
