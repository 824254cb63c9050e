pub mod backend;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod resilience;

pub use config::AppConfig;
pub use dispatch::{DispatchRequest, Dispatcher};
pub use error::{Error, Result};
