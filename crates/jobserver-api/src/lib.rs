// ABOUTME: Transport-neutral facade over the jobserver store and job manager.
// ABOUTME: Exposes the public endpoints as async methods with serde request and response types.

pub mod error;
pub mod query;
pub mod server;

pub use error::ApiError;
pub use query::{ErrorQuery, JobUpdateQuery, Page, TimeWindowQuery};
pub use server::JobServer;
