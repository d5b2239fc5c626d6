//! Persisted member state
//!
//! A single JSON file holding member states and remaining cooldowns so a
//! daemon restart honors in-flight cooldowns. Writes are atomic (temp file
//! in the same directory, then rename). Monotonic timestamps do not survive
//! restarts, so cooldowns are stored as remaining durations.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain_types::MemberName;
use crate::member::MemberState;
use crate::registry::RegistrySnapshot;
use crate::time_provider::MonoTime;

/// One member's persisted slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMember {
    /// Member name.
    pub name: MemberName,
    /// State at save time.
    pub state: MemberState,
    /// Cooldown remaining at save time, milliseconds.
    pub cooldown_remaining_ms: Option<u64>,
    /// Consecutive error count at save time.
    pub consecutive_errors: u32,
}

/// The persisted file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    /// Wall-clock save time.
    pub saved_at: chrono::DateTime<chrono::Utc>,
    /// Per-member slices.
    pub members: Vec<PersistedMember>,
}

impl PersistedState {
    /// Captures the registry snapshot for persistence.
    #[must_use]
    pub fn capture(snapshot: &RegistrySnapshot, now: MonoTime) -> Self {
        Self {
            saved_at: chrono::Utc::now(),
            members: snapshot
                .members
                .iter()
                .map(|member| PersistedMember {
                    name: member.name.clone(),
                    state: member.state,
                    cooldown_remaining_ms: member.cooldown_until.and_then(|until| {
                        let remaining = until.since(now);
                        (!remaining.is_zero())
                            .then(|| u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX))
                    }),
                    consecutive_errors: member.consecutive_errors,
                })
                .collect(),
        }
    }

    /// The restore entries consumed by the registry.
    #[must_use]
    pub fn restore_entries(&self) -> Vec<(MemberName, MemberState, Option<Duration>, u32)> {
        self.members
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    m.state,
                    m.cooldown_remaining_ms.map(Duration::from_millis),
                    m.consecutive_errors,
                )
            })
            .collect()
    }
}

/// Atomically writes the state file (write-temp + rename).
///
/// # Errors
///
/// I/O or serialization failure.
pub async fn save(path: &Path, state: &PersistedState) -> crate::error::Result<()> {
    let json = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), members = state.members.len(), "state persisted");
    Ok(())
}

/// Loads the state file. A missing or corrupt file yields `None`; the daemon
/// starts fresh rather than refusing to run.
pub async fn load(path: &Path) -> Option<PersistedState> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read persisted state");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt persisted state");
            None
        }
    }
}
