pub mod cli;
pub mod core;
pub mod negotiation;
pub mod remote;
pub mod storage;
