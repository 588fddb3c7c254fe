pub mod config;
pub mod error;
pub mod message;
pub mod remote;
pub mod session;
pub mod step;
