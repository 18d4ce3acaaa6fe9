//! Attachment lifecycle for the TC classifier programs.
//!
//! The controller owns the set of tracked links and keeps this invariant:
//!
//! ```text
//! (iface, direction) tracked  <=>  exactly one classifier filter on that hook
//! ```
//!
//! Attaching purges any filter with our program name before installing a new
//! one, so re-attaching (including after an unclean restart) never stacks
//! duplicates. A partial attach is rolled back.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    iface::{
        IfaceError,
        backend::{Direction, TcBackend},
        discovery::{AttachPolicy, LinkInfo},
        netlink_monitor::LinkChange,
    },
    metrics::registry,
};

pub struct IfaceController<B: TcBackend> {
    backend: B,
    policy: AttachPolicy,
    links: BTreeMap<(String, Direction), B::LinkHandle>,
}

impl<B: TcBackend> IfaceController<B> {
    pub fn new(backend: B, policy: AttachPolicy) -> Self {
        Self {
            backend,
            policy,
            links: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> &AttachPolicy {
        &self.policy
    }

    /// Tracked `(iface, direction)` pairs in sorted order.
    pub fn attachments(&self) -> Vec<(String, Direction)> {
        self.links.keys().cloned().collect()
    }

    pub fn attached_interfaces(&self) -> BTreeSet<String> {
        self.links.keys().map(|(iface, _)| iface.clone()).collect()
    }

    /// Attaches to every candidate the policy selects. Per-interface failures
    /// are logged and skipped; zero successes is an error.
    pub fn initialize(&mut self, candidates: &[LinkInfo]) -> Result<usize, IfaceError> {
        let selected: Vec<&LinkInfo> = candidates
            .iter()
            .filter(|link| self.policy.matches(link))
            .collect();

        info!(
            event.name = "iface.initializing",
            iface_count = selected.len(),
            "attaching classifier to candidate interfaces"
        );

        let mut attached = 0;
        for link in &selected {
            match self.attach_iface(&link.name) {
                Ok(()) => attached += 1,
                Err(e) => warn!(
                    event.name = "iface.attach_skipped",
                    network.interface.name = %link.name,
                    error.message = %e,
                    "failed to attach classifier, skipping interface"
                ),
            }
        }

        if attached == 0 {
            return Err(IfaceError::NoInterfacesAttached {
                candidates: selected.len(),
            });
        }

        info!(
            event.name = "iface.initialized",
            iface_count = attached,
            tc_links = self.links.len(),
            "classifier attached"
        );
        Ok(attached)
    }

    /// Attaches ingress and egress on `iface`. Idempotent: any link already on
    /// a hook is replaced.
    pub fn attach_iface(&mut self, iface: &str) -> Result<(), IfaceError> {
        if let Err(e) = self.backend.ensure_clsact(iface) {
            record("attach", "error");
            return Err(e);
        }

        let mut attached = Vec::with_capacity(Direction::ALL.len());
        for direction in Direction::ALL {
            if let Err(e) = self.attach_direction(iface, direction) {
                error!(
                    event.name = "iface.attach_failed",
                    network.interface.name = %iface,
                    ebpf.program.direction = direction.name(),
                    error.message = %e,
                    "failed to attach classifier, rolling back"
                );
                for done in attached {
                    self.detach_direction(iface, done);
                }
                record("attach", "error");
                self.update_gauge();
                return Err(e);
            }
            attached.push(direction);
        }

        record("attach", "ok");
        self.update_gauge();
        debug!(
            event.name = "iface.attached",
            network.interface.name = %iface,
            "classifier attached to interface"
        );
        Ok(())
    }

    fn attach_direction(&mut self, iface: &str, direction: Direction) -> Result<(), IfaceError> {
        self.detach_direction(iface, direction);
        self.backend.purge(iface, direction)?;
        let link = self.backend.attach(iface, direction)?;
        self.links.insert((iface.to_string(), direction), link);
        Ok(())
    }

    /// Detaches the tracked link on one hook. Failures are logged; the link is
    /// forgotten either way.
    fn detach_direction(&mut self, iface: &str, direction: Direction) -> bool {
        let Some(link) = self.links.remove(&(iface.to_string(), direction)) else {
            return false;
        };
        match self.backend.detach(iface, direction, link) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    event.name = "iface.detach_failed",
                    network.interface.name = %iface,
                    ebpf.program.direction = direction.name(),
                    error.message = %e,
                    "failed to detach classifier"
                );
                false
            }
        }
    }

    /// Detaches both hooks on `iface`. Returns whether anything was tracked.
    pub fn detach_iface(&mut self, iface: &str) -> bool {
        let tracked = Direction::ALL
            .iter()
            .any(|d| self.links.contains_key(&(iface.to_string(), *d)));
        for direction in Direction::ALL {
            self.detach_direction(iface, direction);
        }
        if tracked {
            record("detach", "ok");
            self.update_gauge();
            debug!(
                event.name = "iface.detached",
                network.interface.name = %iface,
                "classifier detached from interface"
            );
        }
        tracked
    }

    /// Applies one link change. Only matching links are attached; any tracked
    /// link that goes down or away is detached.
    pub fn reconcile(&mut self, change: &LinkChange) {
        match change {
            LinkChange::Up(link) => {
                let active = self.attached_interfaces().contains(&link.name);
                if active || !self.policy.matches(link) {
                    return;
                }
                info!(
                    event.name = "iface.interface_added",
                    network.interface.name = %link.name,
                    "detected new interface, attaching classifier"
                );
                if let Err(e) = self.attach_iface(&link.name) {
                    warn!(
                        event.name = "iface.attach_skipped",
                        network.interface.name = %link.name,
                        error.message = %e,
                        "failed to attach classifier, will retry on next link event"
                    );
                }
            }
            LinkChange::Down(name) => {
                if self.detach_iface(name) {
                    info!(
                        event.name = "iface.interface_removed",
                        network.interface.name = %name,
                        "interface went away, classifier detached"
                    );
                }
            }
        }
    }

    /// Detaches every tracked link in sorted order. Returns how many links
    /// were detached cleanly.
    pub fn shutdown(&mut self) -> usize {
        let total = self.links.len();
        let keys: Vec<(String, Direction)> = self.links.keys().cloned().collect();
        let detached = keys
            .into_iter()
            .filter(|(iface, direction)| self.detach_direction(iface, *direction))
            .count();
        self.update_gauge();

        if detached < total {
            warn!(
                event.name = "iface.shutdown_partial",
                tc_links = total,
                detached_count = detached,
                "some classifier links failed to detach"
            );
        }
        info!(
            event.name = "iface.shutdown_completed",
            tc_links = total,
            detached_count = detached,
            "classifier detached from all interfaces"
        );
        detached
    }

    fn update_gauge(&self) {
        registry::IFACE_ATTACHED_LINKS.set(self.links.len() as i64);
    }
}

fn record(operation: &str, status: &str) {
    registry::IFACE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

/// Applies link changes from the netlink monitor until shutdown or until the
/// monitor goes away.
pub async fn run_reconciliation<B: TcBackend>(
    controller: Arc<Mutex<IfaceController<B>>>,
    mut changes: mpsc::UnboundedReceiver<LinkChange>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(
        event.name = "task.started",
        task.name = "iface_reconciliation",
        "watching for interface changes"
    );

    loop {
        let change = tokio::select! {
            _ = shutdown_rx.recv() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };
        controller.lock().await.reconcile(&change);
    }

    info!(
        event.name = "task.stopped",
        task.name = "iface_reconciliation",
        "interface reconciliation stopped"
    );
}
