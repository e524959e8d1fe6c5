//! The `NodeAdmin` pseudo-service: an administrative RPC surface for
//! retire/resume/describe, resolving spec.md Design Note (iii) — the
//! sampled source's retire signal number (`SIGUSR1`-equivalent) isn't
//! portable, so retire is exposed as an RPC here in addition to the signal
//! handler the host binary wires up (both paths call the same
//! [`NodeAdmin::retire`]/`resume`).
//!
//! `NodeAdmin` is deliberately not registered in the cluster view: it is
//! reached only by a local caller (the admin CLI, or the host process's own
//! signal handler), never by another node's dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::service::tree::{LoopHandle, ServiceState};

#[derive(Debug, Serialize, Deserialize)]
pub struct DescribeReply {
    pub node_id: u64,
    pub services: Vec<ServiceDescription>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub state: String,
}

/// Tracks every service this node hosts so `Retire`/`Resume`/`Describe` can
/// act on all of them uniformly, mirroring the sampled source's
/// `NotifyAllServiceRetire` walking `setupServiceList` in reverse.
pub struct NodeAdmin {
    node_id: u64,
    services: std::sync::RwLock<Vec<LoopHandle>>,
    retiring: AtomicBool,
}

impl NodeAdmin {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            services: std::sync::RwLock::new(Vec::new()),
            retiring: AtomicBool::new(false),
        }
    }

    /// Tracks a hosted service by its loop handle, in install order, so
    /// `Retire`/`Stop`/`Describe` can reach it without owning the running
    /// [`crate::service::tree::Service`] itself (its run loop already owns
    /// that by value).
    pub fn track(&self, handle: LoopHandle) {
        self.services.write().unwrap().push(handle);
    }

    /// Transitions every tracked service still `Running` to `Retiring`.
    /// Idempotent; a service already `Stopped` is left alone.
    pub fn retire(&self) {
        self.retiring.store(true, Ordering::SeqCst);
        for handle in self.services.read().unwrap().iter() {
            if handle.state() == ServiceState::Running {
                handle.set_state(ServiceState::Retiring);
            }
        }
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::SeqCst)
    }

    /// Transitions every tracked service still in `Retiring` back to
    /// `Running`. A service already `Stopped` is not revived.
    pub fn resume(&self) {
        self.retiring.store(false, Ordering::SeqCst);
        for handle in self.services.read().unwrap().iter() {
            if handle.state() == ServiceState::Retiring {
                handle.set_state(ServiceState::Running);
            }
        }
    }

    /// Stops every tracked service in reverse install order, per spec.md
    /// §3's "Stop ... releases modules in reverse addition order" lifecycle.
    /// Nudges each loop with a no-op posted task after flipping its state so
    /// a loop parked on an empty queue wakes up and notices `Stopped`
    /// immediately instead of waiting for its next timer or request.
    pub fn stop_all(&self) {
        for handle in self.services.read().unwrap().iter().rev() {
            handle.set_state(ServiceState::Stopped);
            let _ = handle.post(|_| {});
        }
    }

    pub fn describe(&self) -> DescribeReply {
        let services = self
            .services
            .read()
            .unwrap()
            .iter()
            .map(|h| ServiceDescription {
                name: h.service_name().to_owned(),
                state: format!("{:?}", h.state()),
            })
            .collect();
        DescribeReply {
            node_id: self.node_id,
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_admin_is_not_retiring() {
        let admin = NodeAdmin::new(1);
        assert!(!admin.is_retiring());
    }

    #[test]
    fn retire_is_idempotent_and_sticky() {
        let admin = NodeAdmin::new(1);
        admin.retire();
        admin.retire();
        assert!(admin.is_retiring());
    }

    #[test]
    fn resume_clears_retiring_and_only_revives_retiring_handles() {
        use crate::service::tree::Service;

        let admin = NodeAdmin::new(1);
        let (_service, handle) = Service::new("Math", 1);
        handle.set_state(ServiceState::Stopped);
        admin.track(handle.clone());
        admin.retire();
        assert!(admin.is_retiring());

        admin.resume();
        assert!(!admin.is_retiring());
        // a Stopped service is not revived by resume
        assert_eq!(handle.state(), ServiceState::Stopped);
    }

    #[test]
    fn describe_lists_tracked_services() {
        use crate::service::tree::Service;

        let admin = NodeAdmin::new(7);
        let (service, handle) = Service::new("Math", 1);
        service.seal_handlers();
        admin.track(handle);

        let reply = admin.describe();
        assert_eq!(reply.node_id, 7);
        assert_eq!(reply.services.len(), 1);
        assert_eq!(reply.services[0].name, "Math");
    }
}
