//! vPLC Orchestrator Agent Library
//!
//! The agent runs on each edge host and manages the lifecycle of vPLC runtime
//! containers. It holds a single authenticated control channel to the cloud
//! controller and converges container network attachments when the host's
//! interfaces change.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//! ├── CloudSession        (mTLS WebSocket, reconnecting)
//! │   ├── Dispatcher      (topic table, schema validation)
//! │   └── Telemetry       (5 s heartbeat while connected)
//! ├── NetmonClient        (Unix-socket event stream -> interface cache)
//! └── ReconfigLoop        (debounced MACVLAN reconfiguration)
//! ```
//!
//! ## Modules
//!
//! - `engine`: container engine seam (Docker implementation + test mock)
//! - `lifecycle`: idempotent create/delete/inspect/reconfigure of runtimes
//! - `registry`: persisted map of managed containers and their vNICs
//! - `netmon`: host interface event stream client and cache
//! - `session` / `dispatch` / `telemetry`: the cloud side

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod netmon;
pub mod ops;
pub mod proxy;
pub mod reconfig;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod usage;

pub use config::Config;
pub use engine::{ContainerEngine, MockEngine};
pub use lifecycle::Lifecycle;
pub use registry::{Registry, VnicConfig};
