//! Client-side synchronization layer for Kubernetes resource views and
//! interactive sessions, multiplexed over one event bus.

pub mod backend;
pub mod bus;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod k8s;
pub mod logs;
pub mod model;
pub mod port_forward;
pub mod scope;
pub mod session;
pub mod shell;
pub mod watch;

#[cfg(test)]
mod mock;

pub use backend::{Backend, SyncContext, WatchScope};
pub use bus::{EventBus, Listener};
pub use cache::{CacheStore, Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use watch::{ResourceWatchCache, WatchCallbacks, WatchSubscription};
