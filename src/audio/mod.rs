//! # Audio Module
//!
//! Per-guild playback queues and the machinery that drives them.
//!
//! - [`track`]: the playable item and loop modes
//! - [`queue`]: the pure queue state machine ([`queue::QueueState`])
//! - [`manager`]: the guild registry that applies state-machine effects
//! - [`inactivity`]: the single-slot idle timer
//! - [`backend`]: contracts for players, voice connections and notifications
//! - [`songbird_backend`]: the songbird/yt-dlp implementation of those contracts

pub mod backend;
pub mod inactivity;
pub mod manager;
pub mod queue;
pub mod songbird_backend;
pub mod track;

pub use manager::QueueManager;
pub use songbird_backend::{SelfDisconnects, SongbirdConnection, SongbirdFactory};

/// The production queue manager.
pub type Jukebox = QueueManager<SongbirdFactory, SongbirdConnection>;
