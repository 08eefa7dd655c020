pub mod config;
pub mod crawler;
pub mod cursor;
pub mod db;
pub mod engine;
pub mod error;
pub mod llm;
pub mod locks;
pub mod models;
pub mod platform;
pub mod retention;
pub mod retry;
pub mod session;
pub mod summarize;
pub mod sync;

#[cfg(test)]
mod testing;

pub use engine::Engine;
pub use error::{Result, SyncError};
