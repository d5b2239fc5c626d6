//! Hotplug contract: interface up/down events
//!
//! The init integration invokes a tiny hotplug script that forwards
//! `ACTION`/`INTERFACE` pairs to the daemon. Events land on a channel; the
//! scheduler reconciles the registry and, when the affected member is the
//! current primary, runs an immediate re-evaluation tick.

use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::domain_types::InterfaceName;

/// One interface state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    /// OS interface that changed.
    pub interface: InterfaceName,
    /// True for `ifup`, false for `ifdown`.
    pub up: bool,
}

impl HotplugEvent {
    /// Builds an event from hotplug environment variables
    /// (`ACTION` ∈ {ifup, ifdown}, `INTERFACE`). Other actions are ignored.
    #[must_use]
    pub fn from_env_map(env: &HashMap<String, String>) -> Option<Self> {
        let up = match env.get("ACTION").map(String::as_str) {
            Some("ifup") => true,
            Some("ifdown") => false,
            _ => return None,
        };
        let interface = env
            .get("INTERFACE")
            .and_then(|name| InterfaceName::try_new(name.clone()).ok())?;
        Some(Self { interface, up })
    }
}

/// Channel capacity for hotplug events; bursts beyond this are dropped by
/// the sender.
pub const HOTPLUG_CHANNEL_CAPACITY: usize = 16;

/// Creates the hotplug channel pair.
#[must_use]
pub fn channel() -> (mpsc::Sender<HotplugEvent>, mpsc::Receiver<HotplugEvent>) {
    mpsc::channel(HOTPLUG_CHANNEL_CAPACITY)
}
