//! # Open Music Link
//!
//! Client runtime for Lavalink v4 audio nodes: node connections with session
//! resume, per-guild players with queues and filters, and snapshot
//! persistence so playback survives node outages and process restarts.
//!
//! ## Usage
//!
//! ```no_run
//! use open_music_link::{config::Config, storage::JsonStore, Manager};
//! # use open_music_link::gateway::VoiceGateway;
//! # use serenity::model::id::UserId;
//! # use std::sync::Arc;
//! # async fn run(gateway: Arc<dyn VoiceGateway>) -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(JsonStore::new(config.data_dir.clone()).await?);
//! let manager: Manager<serde_json::Value> =
//!     Manager::new(config.nodes, config.options, store, gateway);
//! manager.init(UserId::new(config.application_id)).await?;
//!
//! let mut events = manager.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod manager;
pub mod node;
pub mod retry;
pub mod storage;

pub use audio::{
    filters::Filters,
    player::{Player, PlayerOptions, PlayerSnapshot},
    queue::TrackQueue,
    track::{RepeatMode, Track, UserData},
};
pub use error::{Error, Result};
pub use events::Event;
pub use manager::{Manager, SearchResult};
pub use node::{Node, NodeState};
