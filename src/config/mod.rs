//! # Configuration
//!
//! - `bootstrap`: process-level tuning loaded from environment variables
//! - `request`: the validated description of one bootstrap run
//! - `duration`: parsing of `30s` / `5m` / `1h` style durations

pub mod bootstrap;
pub mod duration;
pub mod request;

pub use bootstrap::BootstrapConfig;
pub use duration::{deadline_after, parse_duration};
pub use request::{
    BootstrapRequest, CommitAuthor, CredentialPolicy, KeyAlgorithm, ProviderKind,
    RepositorySpec, Visibility,
};
