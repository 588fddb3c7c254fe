use regex::Regex;
use std::sync::LazyLock;

use crate::core::config::NegotiationConfig;
use crate::core::session::{SessionRecord, TrialStatus};

/// Longest utterance still treated as a "short" affirmative.
const SHORT_REPLY_MAX_WORDS: usize = 8;

static EXPLICIT_ACCEPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(i accept|accepted|i'?ll take it|i will take it|it'?s a deal|deal|let'?s do it|sign me up|lock it in|agreed|i agree|works for me|count me in)\b",
    )
    .expect("static regex")
});

static SHORT_AFFIRMATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(yes|yeah|yep|yup|sure|ok|okay|alright|fine|great|perfect|sounds good|works|go ahead|confirm)\b",
    )
    .expect("static regex")
});

static NEGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(no|nope|nah|not|never|don'?t|doesn'?t|can'?t|cannot|won'?t|wouldn'?t|too (much|expensive|high|pricey))\b",
    )
    .expect("static regex")
});

static COUNTER_OFFER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(what about|how about|could you do|can you do|would you do|lower|cheaper|less|discount|instead|meet me|counter|go down)\b",
    )
    .expect("static regex")
});

/// An amount marked as money by a `$` sign or a currency word.
static PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s*(\d+(?:\.\d{1,2})?)|\b(\d+(?:\.\d{1,2})?)\s*(?:dollars|bucks|usd)\b")
        .expect("static regex")
});

static BARE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d{1,2})?\b").expect("static regex"));

/// Outcome of recording a proposed price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferDecision {
    /// Price actually in effect after clamping and the no-increase rule.
    pub applied_cents: u64,
    /// True when this offer exhausted the escalation budget and the trial
    /// fallback should be presented now.
    pub trigger_trial: bool,
}

/// Price escalation rules: prices only go down, never below the floor, and
/// after enough distinct offers a single trial fallback is proposed.
#[derive(Debug, Clone)]
pub struct OfferPolicy {
    min_price_cents: u64,
    max_offers: usize,
}

impl OfferPolicy {
    pub fn new(min_price_cents: u64, max_offers: usize) -> Self {
        Self {
            min_price_cents,
            max_offers,
        }
    }

    pub fn from_config(config: &NegotiationConfig) -> Self {
        Self::new(config.min_price_cents, config.max_offers)
    }

    pub fn min_price_cents(&self) -> u64 {
        self.min_price_cents
    }

    pub fn record_offer(&self, record: &mut SessionRecord, price_cents: u64) -> OfferDecision {
        let clamped = price_cents.max(self.min_price_cents);
        let last = record.last_offer();

        let applied = match last {
            Some(prev) if clamped > prev => {
                tracing::debug!(proposed = clamped, kept = prev, "rejecting price increase");
                prev
            }
            _ => clamped,
        };

        if last != Some(applied) {
            record.offer_history.push(applied);
        }
        record.current_offer_cents = Some(applied);

        let trigger_trial =
            record.offer_history.len() >= self.max_offers && self.trial_allowed(record);

        OfferDecision {
            applied_cents: applied,
            trigger_trial,
        }
    }

    /// A trial may be put on the table only once, unless the user declined it
    /// and asked for it again.
    pub fn trial_allowed(&self, record: &SessionRecord) -> bool {
        record.trial_status == TrialStatus::None && !record.trial_declined
    }

    /// Mark the trial as offered, priced at the lowest offer made so far.
    pub fn mark_trial_offered(&self, record: &mut SessionRecord) -> u64 {
        let cents = record
            .lowest_offer()
            .or(record.current_offer_cents)
            .unwrap_or(self.min_price_cents)
            .max(self.min_price_cents);
        record.trial_status = TrialStatus::Offered;
        record.trial_offer_cents = Some(cents);
        cents
    }

    /// Sanitize an externally supplied history (server reconciliation) so it
    /// satisfies the ordering and floor invariants.
    pub fn sanitize_history(&self, history: &[u64]) -> Vec<u64> {
        let mut out: Vec<u64> = Vec::with_capacity(history.len());
        for &price in history {
            let clamped = price.max(self.min_price_cents);
            match out.last() {
                Some(&prev) if clamped >= prev => {}
                _ => out.push(clamped),
            }
        }
        out
    }

    /// Client-side acceptance detection. The backend does not always flag
    /// acceptance explicitly, so colloquial agreement is recognized here.
    pub fn accepts(
        &self,
        utterance: &str,
        awaiting_confirmation: bool,
        current_offer_cents: Option<u64>,
    ) -> bool {
        let text = utterance.trim().to_lowercase();
        if text.is_empty() {
            return false;
        }

        if NEGATION.is_match(&text) || COUNTER_OFFER.is_match(&text) {
            return false;
        }

        // Only amounts marked as money can contradict the offer. A bare
        // number ("6 months", "2 seats") counts only when it equals it.
        let prices = mentioned_prices(&text);
        if prices.iter().any(|p| Some(*p) != current_offer_cents) {
            return false;
        }
        let mentions_current = current_offer_cents
            .is_some_and(|current| prices.contains(&current) || bare_amounts(&text).contains(&current));

        if EXPLICIT_ACCEPT.is_match(&text) {
            return true;
        }

        let short = text.split_whitespace().count() <= SHORT_REPLY_MAX_WORDS;
        short && SHORT_AFFIRMATIVE.is_match(&text) && (awaiting_confirmation || mentions_current)
    }
}

/// Dollar amounts mentioned in `text`, in cents. Numbers without a `$` or
/// currency word are not prices.
pub fn mentioned_prices(text: &str) -> Vec<u64> {
    PRICE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .filter_map(|m| to_cents(m.as_str()))
        .collect()
}

fn bare_amounts(text: &str) -> Vec<u64> {
    BARE_NUMBER
        .find_iter(text)
        .filter_map(|m| to_cents(m.as_str()))
        .collect()
}

fn to_cents(amount: &str) -> Option<u64> {
    let dollars = amount.parse::<f64>().ok()?;
    Some((dollars * 100.0).round() as u64)
}
