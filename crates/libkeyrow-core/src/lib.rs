//! Core types for keyrow
//!
//! This crate carries the pieces of keyrow that do not touch git:
//! - record keys and their normalization rules
//! - repository options, TOML persistence, and mirror path derivation
//! - the cancellation token honored at remote call boundaries

mod cancel;
mod config;
mod error;
mod key;

pub use cancel::CancelToken;
pub use config::{
    load_options, save_options, RepoOptions, DEFAULT_BRANCH, DEFAULT_DEPTH, DEFAULT_SSH_USER,
    DEFAULT_VOLUME,
};
pub use error::KeyrowError;
pub use key::{Key, KeyError};
