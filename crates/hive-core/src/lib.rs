pub mod config;
pub mod error;
pub mod io;
pub mod lock;
pub mod paths;
pub mod queue;
pub mod signal;

pub use error::{HiveError, Result};
