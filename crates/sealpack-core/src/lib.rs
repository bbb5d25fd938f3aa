pub mod config;
pub mod error;

pub use error::{ErrorKind, SealError, SealResult};
