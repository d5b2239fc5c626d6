//! # starfail - Multi-WAN Failover Daemon
//!
//! starfail keeps a router with a Starlink dish, one or more cellular
//! modems, and optional Wi-Fi/LAN uplinks on the best available connection.
//! It continuously ranks every managed uplink by real-time quality, decides
//! which one should be primary, and instructs the platform's multi-WAN
//! routing engine to switch, honoring hysteresis, cooldowns, and predictive
//! signals that anticipate imminent degradation.
//!
//! ## Architecture
//!
//! The core is one closed control loop:
//!
//! ```text
//! scheduler tick
//!   ├─ collectors (parallel, one per member, bounded pool)
//!   ├─ telemetry store + registry bookkeeping
//!   ├─ decision engine (scoring, hysteresis, predictive triggers)
//!   ├─ controller (routing-engine metrics + reload + verify)
//!   └─ decision audit
//! ```
//!
//! External collaborators (the CLI, ubus transport, HTTP endpoints,
//! notification delivery) talk to the loop through narrow seams: the RPC
//! surface, the hotplug channel, and the config handle. The daemon never
//! forwards packets itself.

// Core modules
pub mod collector;
pub mod config;
pub mod controller;
pub mod domain_types;
pub mod engine;
pub mod error;
pub mod hotplug;
pub mod member;
pub mod observability;
pub mod persist;
pub mod platform;
pub mod registry;
pub mod retry;
pub mod rpc;
pub mod scheduler;
pub mod scoring;
pub mod telemetry;
pub mod time_provider;

// Re-export the types most integrations touch.
pub use crate::config::{Config, ConfigError, ConfigHandle, RawConfig};
pub use crate::controller::{Controller, RouteEngine};
pub use crate::domain_types::{InterfaceName, MemberName, RouteMetric};
pub use crate::engine::{DecisionEngine, ManualAction, ManualRequest};
pub use crate::error::{Result, StarfailError};
pub use crate::member::{Decision, Member, MemberClass, MemberState, Sample, Score};
pub use crate::registry::{MemberRegistry, RegistrySnapshot};
pub use crate::rpc::{ActionKind, ActionRequest, DaemonCommand, RpcSurface};
pub use crate::scheduler::{Scheduler, SchedulerParts};
pub use crate::telemetry::{StoreLimits, TelemetryStore};
pub use crate::time_provider::{MonoTime, SharedTimeProvider, TimeProvider};
