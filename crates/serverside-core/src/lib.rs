pub mod actions;
pub mod assets;
pub mod config;
pub mod custom_tasks;
pub mod dependencies;
pub mod error;
pub mod fleet;
pub mod hooks;
pub mod io;
pub mod maintenance;
pub mod paths;
pub mod pipeline;
pub mod server;
pub mod source;
pub mod transport;

pub use error::{DeployError, Result};
