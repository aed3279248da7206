pub mod rest;
pub mod server;

pub use rest::{AppState, IdempotencyCache};
pub use server::ApiServer;
