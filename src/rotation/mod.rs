//! Key lifecycle orchestration: generation, secret rotation, consistency
//! checks at point of use, and export of admin credentials.

mod coordinator;
mod credential;
mod job;

pub use coordinator::*;
pub use credential::AdminCredential;
pub use job::{GenerationJob, JobStatus};

#[cfg(test)]
mod tests;
