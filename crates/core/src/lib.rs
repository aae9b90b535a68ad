//! `clustercmd-core` — identifiers and failure-accounting primitives shared by the
//! command bus and the job runners.
//!
//! This crate has no IO and no async runtime dependency.

pub mod error;
pub mod errors_over_time;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use errors_over_time::{ErrorBurst, ErrorsOverTime};
pub use id::{CommandId, JobId, MemberId};
