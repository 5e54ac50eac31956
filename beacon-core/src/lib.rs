//! # beacon-core
//!
//! Client-side telemetry buffering and delivery.
//!
//! This library provides:
//! - A durable key-value store over SQLite
//! - Named locks that detect an operation interrupted by a crash
//! - A persistent per-collection event queue
//! - HTTP delivery of queued batches to the collector
//! - A dispatch scheduler and the `track` producer API
//!
//! ## Architecture
//!
//! Producers call [`Telemetry::track`], which appends to the
//! [`EventQueue`] and returns. The [`DispatchScheduler`] periodically
//! asks the [`Dispatcher`] for an attempt: under the dispatch lock it
//! snapshots the queue, sends it through the [`Transport`], and removes
//! what was delivered or rejected. Events survive process restarts;
//! an attempt cut short by a crash is detected on the next run.
//!
//! ## Example
//!
//! ```rust,no_run
//! use beacon_core::{Config, Telemetry};
//!
//! # async fn run() -> beacon_core::Result<()> {
//! let config = Config::load()?;
//! let telemetry = Telemetry::open(&config)?;
//! telemetry.start()?;
//! telemetry.track("checkout", serde_json::Map::new())?;
//! let attempt = telemetry.dispatch_now().await;
//! println!("{:?}", attempt.outcome);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use dispatch::{DispatchAttempt, DispatchOutcome, DispatchProgress, Dispatcher};
pub use error::{Error, Result};
pub use lock::{LockError, LockManager};
pub use queue::{Batch, Event, EventQueue};
pub use reachability::{AssumeReachable, ConnectionMonitor, ConnectionType, ReachabilityProbe};
pub use scheduler::{DispatchScheduler, SchedulerState};
pub use store::{DurableStore, MemoryBackend, SqliteBackend, StorageBackend};
pub use telemetry::Telemetry;
pub use transport::{Ack, HttpTransport, Transport, TransportError};

// Public modules
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod logging;
pub mod queue;
pub mod reachability;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod transport;
