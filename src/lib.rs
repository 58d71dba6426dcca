pub mod api;
pub mod config;
pub mod error;
pub mod sink;
pub mod state;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
