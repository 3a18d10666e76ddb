//! # Audio Module
//!
//! Playback state for every guild served by a Lavalink node.
//!
//! ## Architecture
//!
//! ### [`player`] - Player
//! - One session per guild: voice credentials, transport state, repeat mode
//! - Reacts to node events (track start/end/exception/stuck)
//! - Persists a snapshot after every change so it can be rebuilt on resync
//!
//! ### [`queue`] - Queue Management
//! - FIFO with amortised compaction of consumed slots
//! - Shuffle, range removal and reordering
//! - `current` / `previous` pointers
//!
//! ### [`filters`] - DSP Filters
//! - Independently nullable filter groups plus volume
//! - Equalizer presets mapped onto the node's 15 bands
//!
//! ### [`track`] - Tracks
//! - Resolved tracks carrying opaque caller data

pub mod filters;
pub mod player;
pub mod queue;
pub mod track;
