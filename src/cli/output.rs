use crate::core::message::{Message, MessageRole};
use crate::core::session::{SessionRecord, TrialStatus};
use crate::negotiation::script::format_cents;
use crate::negotiation::{EndReason, EngineEvent};

pub fn render_event(event: &EngineEvent) {
    match event {
        EngineEvent::MessageAppended { message } => {
            if message.role == MessageRole::Assistant {
                print_message(message);
            }
        }
        EngineEvent::StepChanged { from, to } => {
            tracing::debug!(?from, ?to, "step changed");
        }
        EngineEvent::OfferUpdated { cents } => {
            tracing::debug!(cents, "offer updated");
        }
        EngineEvent::TrialChanged { status, offer_cents } => match status {
            TrialStatus::Offered => {
                println!("\x1b[90m(/accept-trial or /decline-trial)\x1b[0m");
            }
            TrialStatus::Expired => {
                let price = offer_cents.map(format_cents).unwrap_or_default();
                println!(
                    "\x1b[33mYour trial has ended.\x1b[0m Pay {price} per month, or /continue-free."
                );
            }
            _ => {}
        },
        EngineEvent::PaymentLink { url } => {
            println!("\x1b[1mPayment link:\x1b[0m {url}");
        }
        EngineEvent::Observed {
            session_id,
            message,
        } => {
            let short = session_id.get(..8).unwrap_or(session_id.as_str());
            println!("\x1b[90m[session {short} is open in another window]\x1b[0m");
            if let Some(message) = message {
                println!("\x1b[90m  last: {}\x1b[0m", message.text);
            }
        }
        EngineEvent::SessionEnded { reason } => match reason {
            EndReason::OwnershipLost => {
                println!("\x1b[33mUse /restart to take the conversation back here.\x1b[0m")
            }
            EndReason::UsageLimit => {}
            EndReason::Concluded => println!("\x1b[90m[session closed]\x1b[0m"),
        },
    }
}

pub fn print_message(message: &Message) {
    match message.role {
        MessageRole::User => println!("\x1b[32;1myou>\x1b[0m {}", message.text),
        MessageRole::Assistant => println!("\x1b[36;1mnegotiator>\x1b[0m {}", message.text),
    }
}

pub fn print_status(record: &SessionRecord, observing: Option<&SessionRecord>) {
    if let Some(other) = observing {
        println!(
            "Observing session {} owned by {}",
            other.session_id, other.owner_id
        );
        return;
    }
    if record.is_blank() {
        println!("No session yet. Say hello to start.");
        return;
    }

    println!("Session: \x1b[90m{}\x1b[0m", record.session_id);
    println!("Step:    {:?}", record.step);
    let offers: Vec<String> = record.offer_history.iter().map(|c| format_cents(*c)).collect();
    if !offers.is_empty() {
        println!("Offers:  {}", offers.join(" -> "));
    }
    if let Some(cents) = record.confirmed_offer_cents {
        println!("Agreed:  {} per month", format_cents(cents));
    }
    if record.trial_status != TrialStatus::None {
        println!("Trial:   {:?}", record.trial_status);
        if let Some(ends) = record.trial_ends_at {
            println!("Ends:    {}", ends.format("%Y-%m-%d"));
        }
    }
}
