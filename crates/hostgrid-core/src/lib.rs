pub mod config;
pub mod retry;
pub mod runtime;
pub mod source;
pub mod types;
pub mod watch;

pub use config::{AgentConfig, parse_duration};
pub use retry::{RetryPolicy, Retryable};
pub use runtime::{
    LaunchCommand, LaunchContext, LaunchError, Runtime, RuntimeLayout, api_server_command,
};
pub use source::SourceUri;
pub use types::*;
pub use watch::WatchName;
