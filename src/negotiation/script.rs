//! Fixed assistant lines used when the backend cannot or must not answer.

pub const LIMIT_REACHED: &str =
    "We've hit the usage limit for this conversation. Please come back later to pick things up.";

pub const CHAT_ENDED: &str =
    "This chat was continued in another window, so it has ended here.";

pub const INTRO_FALLBACK: &str =
    "Thanks for sharing that. Let's talk about pricing: what would feel fair to you per month?";

pub const NEGOTIATION_FALLBACK: &str =
    "Sorry, I lost my train of thought for a second. Could you tell me again what price would work for you?";

pub const CONFIRM_FAILED: &str =
    "I couldn't lock in that price just now. Please say yes again in a moment to retry.";

pub const TRIAL_FAILED: &str = "I couldn't start the trial right now. Please try again in a moment.";

pub const TRIAL_DECLINED: &str = "No problem, let's keep talking about the price then.";

pub const CONTINUE_FREE_FAILED: &str =
    "I couldn't switch you to the free plan right now. Please try again shortly.";

pub const FREE_PLAN: &str = "You're all set on the free plan. You can upgrade any time.";

pub const PAYMENT_COMPLETE: &str = "Payment received, welcome aboard!";

/// `8000` -> `$80`, `6550` -> `$65.50`.
pub fn format_cents(cents: u64) -> String {
    let dollars = cents / 100;
    let rem = cents % 100;
    if rem == 0 {
        format!("${dollars}")
    } else {
        format!("${dollars}.{rem:02}")
    }
}

pub fn trial_offer(cents: u64) -> String {
    format!(
        "How about this: try everything free for a while, then continue at {} per month if it's useful. Want to start the trial?",
        format_cents(cents)
    )
}

pub fn price_confirmed(cents: u64, payment_link: Option<&str>) -> String {
    match payment_link {
        Some(link) => format!(
            "Great, {} per month it is. You can complete payment here: {link}",
            format_cents(cents)
        ),
        None => format!("Great, {} per month it is.", format_cents(cents)),
    }
}

pub fn trial_started(cents: u64, ends_at: &chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "Your trial is active until {}. After that it's {} per month.",
        ends_at.format("%B %-d, %Y"),
        format_cents(cents)
    )
}
