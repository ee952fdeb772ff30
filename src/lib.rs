//! nap: run HTTP request files and playlists, evaluate declarative
//! assertions and report the results.

pub mod cli;
pub mod environment;
pub mod error;
pub mod http;
pub mod report;
pub mod runner;
pub mod script;
pub mod spec;
pub mod testing;

pub use error::{NapError, ParseError, Result};
