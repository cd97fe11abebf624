//! Reply worker: leased job processing with tool-calling model replies.

pub mod agent;
pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod extensions;
pub mod llm;
pub mod store;
pub mod tools;
pub mod worker;

pub use error::{Error, Result};
