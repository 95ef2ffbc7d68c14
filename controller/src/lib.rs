//! # Inventory Sync Controller
//!
//! The controller is the single authority over which game instance may hold
//! a player's inventory, and it keeps the canonical copy of every inventory
//! that has ever been uploaded. Instances ask it for a player's lock, pull the
//! stored inventory, and push the modified one back before releasing.
//!
//! ## Core Responsibilities
//!
//! ### Lock Authority
//! At most one instance holds the lock for a given player at any moment.
//! Locks carry an expiry so that an instance which crashes or loses its
//! connection cannot keep a player frozen forever. The same instance asking
//! again simply extends its lock.
//!
//! ### Canonical Storage
//! Uploads are reassembled from chunks, checked against the digest the
//! instance sent, and committed only if the uploader still holds the lock at
//! the moment of the commit. Each accepted write increments the record
//! version.
//!
//! ### Housekeeping
//! A periodic sweep removes expired locks and abandons uploads that stopped
//! receiving chunks. The database is written back to disk on an interval and
//! once more during shutdown.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! Every request goes through one loop that owns the [`controller::Controller`].
//! Two requests for the same player can therefore never interleave, which is
//! what makes the holder check at commit time meaningful.
//!
//! ### UDP-Based Communication
//! Requests and responses are bincode-encoded datagrams. Instances number
//! their requests and retry on silence; the controller answers idempotently
//! where a retry could otherwise double-apply.
//!
//! ## Module Organization
//!
//! ### Lock Registry (`lock_registry`)
//! Player to holder mapping with expiry, extension and sweeping.
//!
//! ### Database (`database`)
//! Versioned inventory records, holder-checked writes and JSON persistence.
//!
//! ### Instance Manager (`instance_manager`)
//! Which instances have been heard from, and from which address.
//!
//! ### Controller (`controller`)
//! Request dispatch: acquire, release, upload, download, stats.
//!
//! ### Network (`network`)
//! UDP socket tasks and the main loop with its sweep and autosave timers.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use controller::controller::Controller;
//! use controller::database::DatabaseStore;
//! use controller::network::ControllerServer;
//! use shared::config::ControllerConfig;
//! use shared::metrics::SyncMetrics;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let database = DatabaseStore::load("inventories.json")?;
//!     let controller = Controller::new(
//!         ControllerConfig::default(),
//!         database,
//!         Arc::new(SyncMetrics::new()),
//!     );
//!
//!     let mut server = ControllerServer::bind("127.0.0.1:8080", controller).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod controller;
pub mod database;
pub mod instance_manager;
pub mod lock_registry;
pub mod network;
