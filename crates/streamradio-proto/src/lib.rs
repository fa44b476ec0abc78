//! Shared model and persistence for the StreamRadio session daemon.
//!
//! Everything here is free of playback and network plumbing: the station and
//! query types, configuration, platform paths, key-value storage and the
//! favorites collection that sits on top of it.

pub mod config;
pub mod favorites;
pub mod platform;
pub mod protocol;
pub mod state;
pub mod storage;
