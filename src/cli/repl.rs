use anyhow::Result;
use std::io::{self, Write};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use super::output;
use crate::core::error::NegotiationError;
use crate::negotiation::{EngineEvent, EngineInput, NegotiationEngine};

/// How often an active trial is checked for expiry.
const TRIAL_CHECK_INTERVAL: Duration = Duration::from_secs(60);

enum Wake {
    Line(Option<String>),
    Engine(EngineInput),
    Tick,
}

pub async fn run(
    engine: &mut NegotiationEngine,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> Result<()> {
    println!("\x1b[1mnegotiator\x1b[0m v{}", env!("CARGO_PKG_VERSION"));
    println!("Type \x1b[33m/help\x1b[0m for commands, \x1b[33mCtrl-D\x1b[0m to exit.\n");

    for message in engine.transcript() {
        output::print_message(message);
    }
    drain(&mut events);

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut ticker = tokio::time::interval(TRIAL_CHECK_INTERVAL);
    prompt();

    loop {
        let wake = tokio::select! {
            line = lines.next() => Wake::Line(line.transpose()?),
            input = engine.wait_input() => Wake::Engine(input),
            _ = ticker.tick() => Wake::Tick,
        };

        match wake {
            Wake::Line(None) => {
                println!("\nGoodbye!");
                break;
            }
            Wake::Line(Some(line)) => {
                let input = line.trim();
                if input.starts_with('/') {
                    match handle_command(input, engine).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => eprintln!("\x1b[31m{e}\x1b[0m"),
                    }
                } else if !input.is_empty() {
                    if let Err(e) = engine.submit(input).await {
                        report(&e);
                    }
                }
                drain(&mut events);
                prompt();
            }
            Wake::Engine(input) => {
                if let Err(e) = engine.handle_input(input).await {
                    report(&e);
                }
                if drain(&mut events) {
                    prompt();
                }
            }
            Wake::Tick => {
                if let Err(e) = engine.refresh_trial(chrono::Utc::now()).await {
                    report(&e);
                }
                if drain(&mut events) {
                    prompt();
                }
            }
        }
    }

    Ok(())
}

/// Render queued events. Returns whether anything was printed.
fn drain(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> bool {
    let mut any = false;
    while let Ok(event) = events.try_recv() {
        output::render_event(&event);
        any = true;
    }
    any
}

fn prompt() {
    eprint!("\x1b[32;1myou>\x1b[0m ");
    io::stderr().flush().ok();
}

fn report(err: &NegotiationError) {
    match err {
        NegotiationError::NotOwner => eprintln!(
            "\x1b[33mThis conversation is open in another window. Use /restart to move it here.\x1b[0m"
        ),
        NegotiationError::InputRejected(step) => {
            eprintln!("\x1b[33mThat's not available right now ({step:?}).\x1b[0m")
        }
        NegotiationError::SessionEnded | NegotiationError::UsageLimitReached => {
            eprintln!("\x1b[33m{err}.\x1b[0m")
        }
        other => eprintln!("\x1b[31mError: {other}\x1b[0m"),
    }
}

async fn handle_command(input: &str, engine: &mut NegotiationEngine) -> Result<bool> {
    let outcome = match input {
        "/help" | "/h" => {
            println!("\x1b[1mCommands:\x1b[0m");
            println!("  /status         Show offers and session state");
            println!("  /trial          Ask for the trial offer again");
            println!("  /accept-trial   Start the offered trial");
            println!("  /decline-trial  Keep negotiating instead");
            println!("  /continue-free  Stay on the free plan after a trial");
            println!("  /paid           Mark the confirmed price as paid");
            println!("  /restart        Start over in this window");
            println!("  /quit           Exit");
            return Ok(true);
        }
        "/quit" | "/exit" | "/q" => {
            println!("Goodbye!");
            return Ok(false);
        }
        "/status" | "/s" => {
            output::print_status(engine.record(), engine.observed());
            return Ok(true);
        }
        "/trial" => engine.request_trial().await,
        "/accept-trial" => engine.accept_trial().await,
        "/decline-trial" => engine.decline_trial().await,
        "/continue-free" => engine.continue_free().await,
        "/paid" => engine.payment_completed().await,
        "/restart" => {
            let result = engine.restart().await;
            if result.is_ok() {
                println!("Started a new conversation. Say hello!");
            }
            result
        }
        _ => {
            eprintln!("Unknown command: {input}. Type /help for available commands.");
            return Ok(true);
        }
    };

    if let Err(e) = outcome {
        report(&e);
    }
    Ok(true)
}
