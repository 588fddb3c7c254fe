mod database;
mod session_store;


pub use database::Database;
pub use session_store::{OwnerGuard, SessionStore, StoreChange};
