//! # Inventory Sync Instance
//!
//! Instance side of the inventory sync protocol. A game server process uses
//! this library to borrow a player's inventory from the controller when the
//! player joins, and to hand the modified inventory back when they leave.
//!
//! ## Architecture Overview
//!
//! ### Sessions
//! Every player with a checkout in progress has a
//! [`coordinator::SyncCoordinator`] walking through acquire, download,
//! apply and later extract, upload, release. [`sessions::InstanceSync`]
//! keeps one per player so that players never wait on each other.
//!
//! ### Two Seams
//! The coordinator is driven entirely through awaited calls on two traits:
//! [`link::ControllerLink`] for the controller and [`bridge::RconBridge`]
//! for the game engine. Both can be replaced, which is how the tests run the
//! whole protocol without sockets or an engine.
//!
//! ### Failure Handling
//! Transient failures are retried with [`retry::RetryPolicy`]. Lock conflicts
//! go straight back to the caller, and a rejected upload is re-acquired once
//! before the change is given up.
//!
//! ## Module Organization
//!
//! ### Link Module (`link`)
//! - Request ids and response routing over UDP
//! - Multi-datagram downloads as a stream of frames
//! - Mapping controller replies onto [`shared::SyncError`]
//!
//! ### Bridge Module (`bridge`)
//! - Apply and extract over a console command channel
//! - An in-memory engine for tests and the demo binary
//!
//! ### Retry Module (`retry`)
//! Bounded exponential backoff with jitter.
//!
//! ### Coordinator Module (`coordinator`)
//! The per-player state machine.
//!
//! ### Sessions Module (`sessions`)
//! Concurrent sessions and the lock heartbeat.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use instance::bridge::MemoryBridge;
//! use instance::link::UdpLink;
//! use instance::sessions::InstanceSync;
//! use shared::config::InstanceConfig;
//! use shared::metrics::SyncMetrics;
//! use shared::{InstanceId, PlayerKey};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = InstanceConfig::default();
//!     let link = UdpLink::connect("127.0.0.1:8080", InstanceId::from("nauvis"), config.request_timeout).await?;
//!
//!     let sync = Arc::new(InstanceSync::new(
//!         Arc::new(link),
//!         Arc::new(MemoryBridge::new()),
//!         config,
//!         Arc::new(SyncMetrics::new()),
//!     ));
//!     let _heartbeat = sync.spawn_heartbeat();
//!
//!     let player = PlayerKey::new("Alice")?;
//!     sync.player_joined(&player).await?;
//!     // ... the player plays ...
//!     let version = sync.player_left(&player).await?;
//!     println!("stored as version {}", version);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod coordinator;
pub mod link;
pub mod retry;
pub mod sessions;
