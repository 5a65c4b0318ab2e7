pub mod clienv;
pub mod config;
pub mod error;
pub mod kernel;

pub use error::{KernelError, Result};
