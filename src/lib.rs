pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{ChatError, ChatResult};
pub use state::ChatCore;
