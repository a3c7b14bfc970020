//! recproxy - record/playback HTTP proxy for deterministic service tests
//!
//! While recording, requests are forwarded to the real service and every
//! exchange is sanitized and stored. During playback the stored exchanges
//! answer requests without any network access. Recordings can be pinned in a
//! separate git repository through an `assets.json` file.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod compression;
pub mod config;
pub mod error;
pub mod matcher;
pub mod model;
pub mod multipart;
pub mod network;
pub mod pattern;
pub mod recording;
pub mod registry;
pub mod sanitizer;
pub mod storage;
pub mod store;
pub mod transform;

pub use error::{ProxyError, Result};
