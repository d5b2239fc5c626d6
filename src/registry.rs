//! Canonical member registry: discovery, eligibility, and state
//!
//! The registry owns every [`Member`]. Mutations flow through a single-writer
//! path (the scheduler/engine); everyone else reads point-in-time snapshots.
//! Discovery reconciles the configured member set against the routing
//! engine's inventory and hotplug events without churning existing members.

use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{MainConfig, MemberConfig};
use crate::domain_types::{InterfaceName, MemberName};
use crate::member::{Member, MemberState, StateTransitionError};
use crate::time_provider::MonoTime;

/// An interface the routing engine or hotplug reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredMember {
    /// OS interface name.
    pub interface: InterfaceName,
    /// Whether the interface is currently up.
    pub up: bool,
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The named member is not in the registry.
    #[error("member not found: {0}")]
    MemberNotFound(MemberName),

    /// A mutation asked for a forbidden state transition.
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Point-in-time view of the registry, ordered by class then name.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Members in canonical order.
    pub members: Vec<Member>,
    /// Monotonically increasing change counter; equal generations mean an
    /// identical member set and state.
    pub generation: u64,
}

impl RegistrySnapshot {
    /// The current primary, if one exists.
    #[must_use]
    pub fn primary(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.state == MemberState::Primary)
    }

    /// Member by name.
    #[must_use]
    pub fn get(&self, name: &MemberName) -> Option<&Member> {
        self.members.iter().find(|m| &m.name == name)
    }

    /// Members the engine may consider for primary.
    pub fn eligible(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.eligible)
    }

    /// Members that should be collected this tick: everything enabled and
    /// detected, including cooling/failed members that need a good sample
    /// to recover.
    pub fn collectable(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(|m| m.enabled && m.detected && m.state != MemberState::Disabled)
    }
}

/// A member-level event produced by bookkeeping, for notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// The member crossed `fail_threshold` and left the eligible set.
    BecameIneligible(MemberName),
    /// The member crossed `hard_fail_threshold` and is failed.
    HardFailed(MemberName),
    /// A cooling or failed member recovered to candidate.
    Recovered(MemberName),
}

#[derive(Debug, Default)]
struct RegistryInner {
    members: BTreeMap<MemberName, Member>,
    generation: u64,
}

impl RegistryInner {
    fn touch(&mut self) {
        self.generation += 1;
    }

    fn recompute_eligibility(&mut self) {
        for member in self.members.values_mut() {
            member.eligible = member.enabled
                && member.detected
                && matches!(member.state, MemberState::Candidate | MemberState::Primary);
        }
    }
}

/// The canonical member set. Single writer, many snapshot readers.
#[derive(Debug, Default)]
pub struct MemberRegistry {
    inner: RwLock<RegistryInner>,
}

impl MemberRegistry {
    /// Creates an empty registry; populate it with [`MemberRegistry::reconcile`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciles the registry against configuration and the routing
    /// engine's inventory. Idempotent: unchanged inputs leave the snapshot
    /// generation's member set identical.
    ///
    /// Members are created from config, marked detected when the inventory
    /// knows their interface (an empty inventory counts everything as
    /// detected), and removed when no longer configured.
    pub async fn reconcile(&self, configured: &[MemberConfig], inventory: &[DiscoveredMember]) {
        let mut inner = self.inner.write().await;
        let mut changed = false;

        // Remove members that are no longer configured.
        let stale: Vec<MemberName> = inner
            .members
            .keys()
            .filter(|name| !configured.iter().any(|cfg| &cfg.name == *name))
            .cloned()
            .collect();
        for name in stale {
            info!(member = %name, "member removed from configuration");
            inner.members.remove(&name);
            changed = true;
        }

        for cfg in configured {
            let detected = inventory.is_empty()
                || inventory
                    .iter()
                    .any(|d| d.interface == cfg.interface && d.up);
            match inner.members.get_mut(&cfg.name) {
                Some(existing) => {
                    let updated = existing.class != cfg.class
                        || existing.interface != cfg.interface
                        || existing.enabled != cfg.enabled
                        || existing.detected != detected
                        || existing.sim_slot != cfg.sim_slot
                        || existing.metric_good != cfg.metric_good
                        || existing.metric_bad != cfg.metric_bad;
                    if updated {
                        existing.class = cfg.class;
                        existing.interface = cfg.interface.clone();
                        existing.sim_slot = cfg.sim_slot;
                        existing.dish_endpoint = cfg.dish_endpoint.clone();
                        existing.metric_good = cfg.metric_good;
                        existing.metric_bad = cfg.metric_bad;
                        existing.detected = detected;
                        if existing.enabled != cfg.enabled {
                            existing.enabled = cfg.enabled;
                            let next = if cfg.enabled {
                                MemberState::Candidate
                            } else {
                                MemberState::Disabled
                            };
                            if existing.state != next {
                                // Disabling is always legal; re-enabling goes
                                // through candidate.
                                let _ = existing.transition_to(next);
                            }
                        }
                        changed = true;
                    }
                }
                None => {
                    debug!(member = %cfg.name, class = %cfg.class, "member discovered");
                    inner.members.insert(
                        cfg.name.clone(),
                        Member {
                            name: cfg.name.clone(),
                            class: cfg.class,
                            interface: cfg.interface.clone(),
                            sim_slot: cfg.sim_slot,
                            dish_endpoint: cfg.dish_endpoint.clone(),
                            state: if cfg.enabled {
                                MemberState::Candidate
                            } else {
                                MemberState::Disabled
                            },
                            eligible: false,
                            detected,
                            enabled: cfg.enabled,
                            cooldown_until: None,
                            consecutive_errors: 0,
                            consecutive_ok: 0,
                            last_seen_ok: None,
                            metric_good: cfg.metric_good,
                            metric_bad: cfg.metric_bad,
                        },
                    );
                    changed = true;
                }
            }
        }

        inner.recompute_eligibility();
        if changed {
            inner.touch();
        }
    }

    /// Point-in-time snapshot in canonical (class, name) order.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read().await;
        let mut members: Vec<Member> = inner.members.values().cloned().collect();
        members.sort_by(|a, b| a.class.cmp(&b.class).then_with(|| a.name.cmp(&b.name)));
        RegistrySnapshot {
            members,
            generation: inner.generation,
        }
    }

    /// Records the outcome of one collection for a member, updating error
    /// counters, eligibility, and recovery state.
    pub async fn record_collection(
        &self,
        name: &MemberName,
        ok: bool,
        now: MonoTime,
        cfg: &MainConfig,
    ) -> Result<Vec<MemberEvent>> {
        let mut inner = self.inner.write().await;
        let member = inner
            .members
            .get_mut(name)
            .ok_or_else(|| RegistryError::MemberNotFound(name.clone()))?;
        let mut events = Vec::new();

        if ok {
            member.consecutive_errors = 0;
            member.consecutive_ok = member.consecutive_ok.saturating_add(1);
            member.last_seen_ok = Some(now);

            match member.state {
                MemberState::Cooling if member.cooldown_elapsed(now) => {
                    member.transition_to(MemberState::Candidate)?;
                    events.push(MemberEvent::Recovered(name.clone()));
                }
                MemberState::Failed
                    if member.consecutive_ok >= cfg.fail_threshold.into_inner() =>
                {
                    // A failed member must prove itself with sustained good
                    // samples, then still wait out a cooldown.
                    member.transition_to(MemberState::Cooling)?;
                    member.cooldown_until = Some(now + cfg.cooldown);
                    events.push(MemberEvent::Recovered(name.clone()));
                }
                _ => {}
            }
        } else {
            member.consecutive_ok = 0;
            member.consecutive_errors = member.consecutive_errors.saturating_add(1);

            if member.consecutive_errors >= cfg.hard_fail_threshold.into_inner()
                && member.state != MemberState::Failed
            {
                warn!(member = %name, errors = member.consecutive_errors, "member hard-failed");
                member.transition_to(MemberState::Failed)?;
                events.push(MemberEvent::HardFailed(name.clone()));
            } else if member.consecutive_errors >= cfg.fail_threshold.into_inner()
                && matches!(member.state, MemberState::Candidate | MemberState::Primary)
            {
                warn!(member = %name, errors = member.consecutive_errors, "member ineligible, cooling down");
                member.transition_to(MemberState::Cooling)?;
                member.cooldown_until = Some(now + cfg.cooldown);
                events.push(MemberEvent::BecameIneligible(name.clone()));
            }
        }

        inner.recompute_eligibility();
        inner.touch();
        Ok(events)
    }

    /// Commits a successful switch: the old primary cools down, the new
    /// primary takes over, both carry the switch cooldown.
    ///
    /// # Errors
    ///
    /// `MemberNotFound` when either side is missing; `StateTransition` when
    /// the machine forbids the move.
    pub async fn apply_switch(
        &self,
        from: Option<&MemberName>,
        to: &MemberName,
        now: MonoTime,
        cooldown: std::time::Duration,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.members.contains_key(to) {
            return Err(RegistryError::MemberNotFound(to.clone()));
        }

        if let Some(from_name) = from {
            if let Some(old) = inner.members.get_mut(from_name) {
                if old.state == MemberState::Primary {
                    old.transition_to(MemberState::Cooling)?;
                }
                old.cooldown_until = Some(now + cooldown);
            }
        }

        // Defend the single-primary invariant even if state drifted.
        for member in inner.members.values_mut() {
            if member.state == MemberState::Primary && Some(&member.name) != from {
                warn!(member = %member.name, "demoting stray primary");
                member.transition_to(MemberState::Cooling)?;
            }
        }

        let member = inner
            .members
            .get_mut(to)
            .ok_or_else(|| RegistryError::MemberNotFound(to.clone()))?;
        member.transition_to(MemberState::Primary)?;
        member.cooldown_until = Some(now + cooldown);

        inner.recompute_eligibility();
        inner.touch();
        Ok(())
    }

    /// Applies a hotplug event: flips `detected` on members riding the
    /// interface. Returns the affected members and whether one was primary.
    pub async fn interface_event(&self, interface: &InterfaceName, up: bool) -> (Vec<MemberName>, bool) {
        let mut inner = self.inner.write().await;
        let mut affected = Vec::new();
        let mut primary_affected = false;
        for member in inner.members.values_mut() {
            if &member.interface == interface && member.detected != up {
                member.detected = up;
                affected.push(member.name.clone());
                if member.state == MemberState::Primary {
                    primary_affected = true;
                }
            }
        }
        if !affected.is_empty() {
            inner.recompute_eligibility();
            inner.touch();
        }
        (affected, primary_affected)
    }

    /// Restores persisted member state (states and remaining cooldowns) on
    /// startup. Unknown members are ignored.
    pub async fn restore(
        &self,
        entries: Vec<(MemberName, MemberState, Option<std::time::Duration>, u32)>,
        now: MonoTime,
    ) {
        let mut inner = self.inner.write().await;
        for (name, state, cooldown_remaining, consecutive_errors) in entries {
            if let Some(member) = inner.members.get_mut(&name) {
                // Restored primaries become candidates: no switch happens
                // before the first fresh tick completes.
                member.state = match state {
                    MemberState::Primary | MemberState::Candidate => MemberState::Candidate,
                    other => other,
                };
                member.consecutive_errors = consecutive_errors;
                member.cooldown_until = cooldown_remaining.map(|remaining| now + remaining);
            }
        }
        inner.recompute_eligibility();
        inner.touch();
    }
}
