pub mod config;
pub mod exec;
pub mod mux;
pub mod options;

pub use config::{Config, TransportConfig};
pub use exec::ExecSession;
pub use mux::{ChannelKind, MuxChannel, MuxConnection};
pub use options::ClientOptions;
