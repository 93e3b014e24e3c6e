pub mod report;
pub mod retry;
pub mod term;

pub use retry::RetryStrategy;
