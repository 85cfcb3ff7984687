//! # miner-core
//!
//! Signal-fusion engine for monitoring coding-agent sessions. Three monitors
//! (debug-log activity, process sampling, the hook feed) push normalized events
//! into one queue; a single coordinator thread folds them into one status per
//! session and publishes changes.
//!
//! ## Design Principles
//!
//! - **Synchronous**: plain threads and `std::sync::mpsc`; no async runtime.
//! - **Single writer**: only the coordinator touches the registry. Everyone
//!   else enqueues events or reads copies.
//! - **Deterministic rules**: classification uses event timestamps, never the
//!   clock, so replaying events reproduces state.
//! - **Contained failures**: per-event I/O and parse errors stay inside the
//!   monitor that hit them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use miner_core::{spawn_coordinator, SignalProcessControl, MinerConfig};
//!
//! let config = MinerConfig::default();
//! let (handle, join) = spawn_coordinator(
//!     config.classifier.policy(),
//!     config.coordinator.clone(),
//!     SignalProcessControl,
//! )?;
//! let events = handle.subscribe();
//! let sessions = handle.sessions();
//! ```

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod identity;
pub mod monitor;
pub mod patterns;
pub mod process;
pub mod queue;
pub mod registry;
pub mod session;
pub mod setup;
pub mod storage;

pub use config::{load_config, MinerConfig};
pub use coordinator::{spawn_coordinator, CoordinatorHandle, CoordinatorStatus};
pub use error::{ConfigError, KillError, MonitorError, Result, SetupError};
pub use events::{HookEvent, LogEvent, MonitorEvent, ResourceSample};
pub use identity::{is_canonical_session_id, SessionIdentity};
pub use monitor::{
    spawn_monitor, FeedReceiver, LogWatcher, MonitorSource, ReceiverStats,
    ReceiverStatsSnapshot, ResourceMonitor, StopFlag,
};
pub use process::{ProcessControl, SignalProcessControl};
pub use queue::{event_queue, Command, EventReceiver, EventSender};
pub use registry::Registry;
pub use session::{apply_hook, derive_status, ClassifierPolicy, Session};
pub use setup::{HookInstaller, HookStatus, MINER_HOOK_EVENTS};
pub use storage::StoragePaths;
