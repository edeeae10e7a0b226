use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mirrex_config::HaloOptions;
use mirrex_model::{ChildEvent, ChildMask, ClusterEvent};

/// Latency assigned to a child that came up before its first ping sample, so
/// halo selection prefers anything with real data over it.
pub(crate) const HALO_UNMEASURED_LATENCY: i64 = 99999;

/// Settings the state machine consults on every transition. Derived once
/// from the replica-set options.
#[derive(Debug, Clone)]
pub(crate) struct TopologySettings {
    pub halo: Option<HaloOptions>,
    pub quorum_count: usize,
    pub has_thin_arbiter: bool,
}

/// Deferred work computed under the topology lock and executed after it is
/// released. No I/O and no task spawning happen while the lock is held.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TopologyAction {
    Propagate(ClusterEvent),
    /// A child completed an UP transition at the given generation; saved
    /// lock records must be stamped and queued for healing.
    LaunchLockHeal { child: usize, event_gen: u32 },
    /// A child completed a DOWN transition at the given generation; lock
    /// records must drop the node and re-check quorum.
    MarkLocksDown { child: usize, event_gen: u32 },
}

/// Mutable topology state of one replica set. Guarded by the replica-set
/// topology mutex; every method here runs under it.
#[derive(Debug)]
pub(crate) struct Topology {
    child_up: Vec<bool>,
    halo_child_up: Vec<bool>,
    child_latency: Vec<i64>,
    last_event: Vec<Option<ChildEvent>>,
    event_generation: u32,
    initial_propagated: bool,
    had_quorum: bool,
    pub(crate) stagger: Option<JoinHandle<()>>,
    pub(crate) ta_child_up: bool,
    pub(crate) ta_last_event: Option<ChildEvent>,
    pub(crate) ta_event_gen: u32,
}

impl Topology {
    pub(crate) fn new(child_count: usize) -> Self {
        Topology {
            child_up: vec![false; child_count],
            halo_child_up: vec![false; child_count],
            child_latency: vec![-1; child_count],
            last_event: vec![None; child_count],
            event_generation: 0,
            initial_propagated: false,
            had_quorum: false,
            stagger: None,
            ta_child_up: false,
            ta_last_event: None,
            ta_event_gen: 0,
        }
    }

    pub(crate) fn event_generation(&self) -> u32 {
        self.event_generation
    }

    pub(crate) fn up_mask(&self) -> ChildMask {
        self.child_up.clone().into()
    }

    pub(crate) fn up_count(&self) -> usize {
        self.child_up.iter().filter(|up| **up).count()
    }

    pub(crate) fn is_up(&self, child: usize) -> bool {
        self.child_up.get(child).copied().unwrap_or(false)
    }

    pub(crate) fn latency(&self, child: usize) -> i64 {
        self.child_latency.get(child).copied().unwrap_or(-1)
    }

    pub(crate) fn latencies(&self) -> Vec<i64> {
        self.child_latency.clone()
    }

    fn heard_from_all(&self, settings: &TopologySettings) -> bool {
        self.last_event.iter().all(Option::is_some)
            && (!settings.has_thin_arbiter || self.ta_last_event.is_some())
    }

    /// The one-shot aggregate sent upward once every child has been heard
    /// from (or given up on by the stagger timer).
    fn initial_aggregate(&self) -> ClusterEvent {
        if self.up_count() > 0 {
            ClusterEvent::Up
        } else if self
            .last_event
            .iter()
            .any(|event| *event == Some(ChildEvent::Connecting))
        {
            ClusterEvent::Connecting
        } else {
            ClusterEvent::Down
        }
    }

    fn worst_up_child(&self) -> Option<usize> {
        let mut worst: Option<(usize, i64)> = None;
        for (i, up) in self.child_up.iter().enumerate() {
            if !up || self.child_latency[i] < 0 {
                continue;
            }
            if worst.is_none_or(|(_, latency)| self.child_latency[i] > latency) {
                worst = Some((i, self.child_latency[i]));
            }
        }
        worst.map(|(i, _)| i)
    }

    fn best_down_child(&self) -> Option<usize> {
        let mut best: Option<(usize, i64)> = None;
        for (i, up) in self.child_up.iter().enumerate() {
            if *up || self.child_latency[i] < 0 {
                continue;
            }
            if best.is_none_or(|(_, latency)| self.child_latency[i] < latency) {
                best = Some((i, self.child_latency[i]));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Process one child notification. Returns the actions to execute once
    /// the topology lock has been dropped.
    pub(crate) fn apply(
        &mut self,
        child: usize,
        event: ChildEvent,
        settings: &TopologySettings,
    ) -> Vec<TopologyAction> {
        let mut actions = Vec::new();
        let mut aggregate = None;

        match event {
            ChildEvent::Up => self.handle_up(child, settings, &mut actions, &mut aggregate),
            ChildEvent::Down => self.handle_down(child, settings, &mut actions, &mut aggregate),
            ChildEvent::Connecting => {
                self.last_event[child] = Some(ChildEvent::Connecting);
            }
            ChildEvent::Ping(latency) => {
                self.handle_ping(child, latency, settings, &mut actions, &mut aggregate);
            }
            ChildEvent::SomeDescendantUp => {
                self.last_event[child] = Some(ChildEvent::SomeDescendantUp);
                aggregate = Some(ClusterEvent::SomeDescendantUp);
            }
            ChildEvent::SomeDescendantDown => {
                self.last_event[child] = Some(ChildEvent::SomeDescendantDown);
                aggregate = Some(ClusterEvent::SomeDescendantDown);
            }
        }

        self.check_quorum(settings, &mut actions);
        self.gate_propagation(aggregate, settings, &mut actions);
        actions
    }

    fn handle_up(
        &mut self,
        child: usize,
        settings: &TopologySettings,
        actions: &mut Vec<TopologyAction>,
        aggregate: &mut Option<ClusterEvent>,
    ) {
        let transition = !self.child_up[child];
        if transition {
            self.event_generation += 1;
        }
        self.child_up[child] = true;
        self.halo_child_up[child] = true;

        if settings.halo.is_some() && self.child_latency[child] < 0 {
            // No ping data yet; park it at the ceiling so measured children
            // win every halo comparison until the first sample arrives.
            self.child_latency[child] = HALO_UNMEASURED_LATENCY;
        }

        if let Some(halo) = settings.halo {
            if self.up_count() > halo.min_replicas
                && let Some(worst) = self.worst_up_child()
                && self.child_latency[worst] > halo.max_latency_ms
            {
                debug!(
                    child = worst,
                    "demoting child above halo threshold while above min-replicas"
                );
                self.event_generation += 1;
                self.child_up[worst] = false;
            }
            if self.up_count() > halo.max_replicas {
                let worst = self.worst_up_child().unwrap_or(child);
                debug!(child = worst, "demoting child above halo max-replicas");
                self.event_generation += 1;
                self.child_up[worst] = false;
            }
        }

        self.last_event[child] = Some(ChildEvent::Up);
        if self.up_count() == 1 {
            info!(child, "subvolume came back up; going online");
            *aggregate = Some(ClusterEvent::Up);
        } else {
            *aggregate = Some(ClusterEvent::SomeDescendantUp);
        }
        if transition {
            actions.push(TopologyAction::LaunchLockHeal {
                child,
                event_gen: self.event_generation,
            });
        }
    }

    fn handle_down(
        &mut self,
        child: usize,
        settings: &TopologySettings,
        actions: &mut Vec<TopologyAction>,
        aggregate: &mut Option<ClusterEvent>,
    ) {
        let transition = self.child_up[child];
        if transition {
            self.event_generation += 1;
        }
        self.child_up[child] = false;
        self.halo_child_up[child] = false;
        self.child_latency[child] = -1;

        if let Some(halo) = settings.halo
            && self.up_count() < halo.min_replicas
            && let Some(best) = self.best_down_child()
        {
            debug!(
                child = best,
                "promoting best down child to satisfy halo min-replicas"
            );
            self.event_generation += 1;
            self.child_up[best] = true;
        }

        self.last_event[child] = Some(ChildEvent::Down);
        if self.up_count() == 0 {
            error!("all subvolumes are down; going offline until one comes back up");
            *aggregate = Some(ClusterEvent::Down);
        } else {
            *aggregate = Some(ClusterEvent::SomeDescendantDown);
        }
        if transition {
            actions.push(TopologyAction::MarkLocksDown {
                child,
                event_gen: self.event_generation,
            });
        }
    }

    fn handle_ping(
        &mut self,
        child: usize,
        latency: i64,
        settings: &TopologySettings,
        actions: &mut Vec<TopologyAction>,
        aggregate: &mut Option<ClusterEvent>,
    ) {
        self.child_latency[child] = latency;
        debug!(child, latency, "ping sample");
        let Some(halo) = settings.halo else {
            return;
        };

        if latency > halo.max_latency_ms
            && self.child_up[child]
            && self.up_count() > halo.min_replicas
        {
            info!(child, latency, "latency exceeds halo threshold, marking child down");
            self.event_generation += 1;
            self.child_up[child] = false;
            // Still eligible for promotion if latency improves.
            self.halo_child_up[child] = true;
            *aggregate = Some(if self.up_count() == 0 {
                ClusterEvent::Down
            } else {
                ClusterEvent::SomeDescendantDown
            });
            actions.push(TopologyAction::MarkLocksDown {
                child,
                event_gen: self.event_generation,
            });
        } else if latency < halo.max_latency_ms
            && !self.child_up[child]
            && self.halo_child_up[child]
        {
            if self.up_count() >= halo.max_replicas {
                info!(child, "not promoting, halo max-replicas reached");
                return;
            }
            info!(child, latency, "latency below halo threshold, marking child up");
            self.event_generation += 1;
            self.child_up[child] = true;
            *aggregate = Some(if self.up_count() == 1 {
                ClusterEvent::Up
            } else {
                ClusterEvent::SomeDescendantUp
            });
            actions.push(TopologyAction::LaunchLockHeal {
                child,
                event_gen: self.event_generation,
            });
        }
    }

    fn check_quorum(&mut self, settings: &TopologySettings, actions: &mut Vec<TopologyAction>) {
        if settings.quorum_count == 0 {
            return;
        }
        let has = self.up_count() >= settings.quorum_count;
        if has != self.had_quorum {
            if has {
                info!(up = self.up_count(), "client quorum met");
                actions.push(TopologyAction::Propagate(ClusterEvent::QuorumMet));
            } else {
                warn!(up = self.up_count(), "client quorum lost");
                actions.push(TopologyAction::Propagate(ClusterEvent::QuorumLost));
            }
            self.had_quorum = has;
        }
    }

    fn gate_propagation(
        &mut self,
        aggregate: Option<ClusterEvent>,
        settings: &TopologySettings,
        actions: &mut Vec<TopologyAction>,
    ) {
        let Some(aggregate) = aggregate else {
            return;
        };
        if self.initial_propagated {
            actions.push(TopologyAction::Propagate(aggregate));
        } else if self.heard_from_all(settings) {
            self.initial_propagated = true;
            if let Some(stagger) = self.stagger.take() {
                stagger.abort();
            }
            actions.push(TopologyAction::Propagate(self.initial_aggregate()));
        }
        // Otherwise suppressed until heard-from-all or the stagger timer.
    }

    /// Stagger timer expiry: give up on silent children, treat them as down,
    /// and release the one-shot aggregate.
    pub(crate) fn stagger_fired(&mut self) -> Option<ClusterEvent> {
        self.stagger = None;
        if self.initial_propagated {
            return None;
        }
        for (i, slot) in self.last_event.iter_mut().enumerate() {
            if slot.is_none() {
                debug!(child = i, "no notification before stagger timeout, assuming down");
                *slot = Some(ChildEvent::SomeDescendantDown);
                self.child_up[i] = false;
            }
        }
        self.initial_propagated = true;
        Some(self.initial_aggregate())
    }

    /// Thin-arbiter witness notification.
    pub(crate) fn apply_ta(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Up => {
                if !self.ta_child_up {
                    self.ta_event_gen += 1;
                }
                self.ta_child_up = true;
                self.ta_last_event = Some(ChildEvent::Up);
            }
            ChildEvent::Down => {
                if self.ta_child_up {
                    self.ta_event_gen += 1;
                }
                self.ta_child_up = false;
                self.ta_last_event = Some(ChildEvent::Down);
            }
            other => {
                if other.is_state() {
                    self.ta_last_event = Some(other);
                }
            }
        }
    }
}
