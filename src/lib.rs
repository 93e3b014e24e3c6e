// Remux library
// Remote-exec attach client: multiplexed websocket transport + session driver

pub mod cli;
pub mod client;
pub mod core;
pub mod utils;

// Re-export commonly used types
pub use crate::client::ApiClient;
pub use crate::core::{ChannelKind, ClientOptions, Config, ExecSession, TransportConfig};
pub use crate::utils::RetryStrategy;

// Error handling
pub use anyhow::{Error, Result};
