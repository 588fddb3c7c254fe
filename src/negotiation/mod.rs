pub mod engine;
pub mod event;
pub mod flusher;
pub mod ownership;
pub mod policy;
pub mod resolver;
pub mod script;
pub mod sync;

#[cfg(test)]
mod tests;

pub use engine::{EngineInput, NegotiationEngine, TurnOutcome};
pub use event::{EndReason, EngineEvent};
