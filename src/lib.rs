#![forbid(unsafe_code)]

//! LocalTube: browse a folder of downloaded videos as a channel catalogue.
//!
//! The crate exposes the scanner and the pieces around it so the backend
//! binary stays a thin HTTP layer.

pub mod config;
pub mod library;
pub mod scanner;
pub mod user_data;
pub mod watcher;
