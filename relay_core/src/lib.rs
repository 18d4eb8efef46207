//! Relay between the warehouse simulation's stores and dashboard clients.
//!
//! Ticks are read from the pub/sub store, reconciled against the static
//! [`World`], diffed, and fanned out to every connected dashboard by
//! [`DashboardServer`]. Order and station aggregates are polled on a
//! separate cadence by [`OrderAggregator`].

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod network;
pub mod orders;
pub mod path;
pub mod pump;
pub mod reconcile;
pub mod store;
pub mod world;

pub use aggregate::{OrderAggregator, OrderFeed};
pub use cache::{CacheSlot, Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RelayConfig, RelayProfile};
pub use metrics::RelayMetrics;
pub use network::{ClientSink, DashboardServer, FanOut, ServerError, UpdatePublisher};
pub use orders::OrderLedger;
pub use pump::TickPump;
pub use reconcile::ReconciliationEngine;
pub use store::{
    CachedSnapshotStore, PubSubSource, RawRobotRow, RedisPubSub, SnapshotSource,
    SourceCapabilities, SqliteSnapshotStore, StoreError, TickEvent, TickNotice,
};
pub use world::{RobotId, RobotState, World, WorldError};
