//! The coordinator thread every region binds to.
//!
//! Grounded on the original `Domain` (`include/mantle/domain.h`,
//! `src/domain.cpp`): one thread owns a [`Selector`] multiplexing the bind
//! doorbell, the [`WriteBarrierManager`]'s page-fault fd, and every bound
//! region's connection, and drives every [`RegionController`] through its
//! eight-phase cycle via a census fixed point each time the selector wakes
//! up.

use crate::config::Config;
use crate::connection::{Connection, Endpoint};
use crate::error::MantleError;
use crate::ledger::WriteBarrierManager;
use crate::object::RegionId;
use crate::region_controller::{self, RegionController, RegionControllerCensus};
use crate::selector::{Selector, SelectorToken};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

/// Shared state reachable from any region thread calling [`Domain::bind`],
/// separate from the fields only the domain's own thread touches.
struct Shared {
    bind_doorbell: crate::doorbell::Doorbell,
    next_region_id: AtomicU16,
    pending: Mutex<Vec<(RegionId, Endpoint)>>,
    shutdown_requested: AtomicBool,
}

/// The domain-side coordinator. `bind` may be called from any thread that
/// wants to register a new region; `run` must be driven from a single,
/// dedicated thread.
pub struct Domain {
    shared: Arc<Shared>,
    manager: Arc<WriteBarrierManager>,
    config: Config,
}

impl Domain {
    /// Creates a domain with the given configuration.
    ///
    /// # Errors
    /// Returns [`MantleError`] if the bind doorbell's `eventfd` or the
    /// write barrier manager's `userfaultfd` cannot be created.
    pub fn new(config: Config) -> Result<Self, MantleError> {
        Ok(Self {
            shared: Arc::new(Shared {
                bind_doorbell: crate::doorbell::Doorbell::new()?,
                next_region_id: AtomicU16::new(0),
                pending: Mutex::new(Vec::new()),
                shutdown_requested: AtomicBool::new(false),
            }),
            manager: Arc::new(WriteBarrierManager::new(config.segment_capacity)?),
            config,
        })
    }

    /// The write barrier manager regions should attach their ledgers to.
    #[must_use]
    pub fn write_barrier_manager(&self) -> Arc<WriteBarrierManager> {
        Arc::clone(&self.manager)
    }

    /// Registers a new region's connection, to be picked up by the next
    /// `run` iteration. Safe to call from any thread.
    ///
    /// # Errors
    /// Returns [`MantleError::SystemCall`] if the connection's doorbells
    /// cannot be created.
    pub fn bind(&self) -> Result<(RegionId, Connection), MantleError> {
        let connection = Connection::new(crate::config::STREAM_CAPACITY)?;
        let region_id = self.shared.next_region_id.fetch_add(1, Ordering::Relaxed);
        self.shared.pending.lock().expect("pending-bind mutex poisoned").push((region_id, connection.server_endpoint()));
        self.shared.bind_doorbell.ring(1);
        Ok((region_id, connection))
    }

    /// Requests that the domain wind down: once every controller is
    /// quiescent, each is sent a stop request, and `run` returns once the
    /// last one shuts down.
    pub fn request_shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::Release);
        self.shared.bind_doorbell.ring(1);
    }

    /// Pins the calling thread to `cpu` before entering [`Self::run`].
    ///
    /// # Errors
    /// Returns [`MantleError::InvalidCpuAffinity`] if `cpu` doesn't exist on
    /// this host or the kernel otherwise refuses the request.
    pub fn pin_to_cpu(cpu: usize) -> Result<(), MantleError> {
        // SAFETY: `set` is fully initialized by `CPU_ZERO`/`CPU_SET` before
        // being passed to `sched_setaffinity`.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            let result = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
            if result != 0 {
                return Err(MantleError::InvalidCpuAffinity(format!("cpu {cpu}: {}", std::io::Error::last_os_error())));
            }
        }
        Ok(())
    }

    /// Runs the domain's coordination loop on the calling thread until
    /// [`Self::request_shutdown`] has been honored by every controller.
    ///
    /// # Errors
    /// Returns [`MantleError::SystemCall`] if the `epoll` instance backing
    /// the selector cannot be created.
    pub fn run(&self) -> Result<(), MantleError> {
        let mut selector = Selector::new()?;
        selector.add_watch(self.shared.bind_doorbell.file_descriptor(), SelectorToken::BindDoorbell);
        selector.add_watch(self.manager.file_descriptor(), SelectorToken::PageFaultHandler);

        let mut controllers: Vec<RegionController> = Vec::new();

        loop {
            let ready = selector.poll(false);

            for token in ready {
                self.handle_event(token, &mut controllers, &mut selector);
            }

            self.synchronize(&mut controllers);
            self.retire_shutdown_controllers(&mut controllers, &mut selector);

            if self.shared.shutdown_requested.load(Ordering::Acquire) && controllers.is_empty() {
                tracing::info!("domain shutdown complete");
                return Ok(());
            }
        }
    }

    fn handle_event(&self, token: SelectorToken, controllers: &mut Vec<RegionController>, selector: &mut Selector) {
        match token {
            SelectorToken::BindDoorbell => {
                self.shared.bind_doorbell.poll(true);
                self.start_controllers(controllers, selector);
            }
            SelectorToken::PageFaultHandler => {
                self.manager.poll();
            }
            SelectorToken::Region(id) => {
                if let Some(controller) = controllers.iter_mut().find(|c| c.id() == id) {
                    controller.poll_messages(true);
                } else {
                    tracing::warn!(region = %id, "event for an unknown region");
                }
            }
        }
    }

    fn start_controllers(&self, controllers: &mut Vec<RegionController>, selector: &mut Selector) {
        let pending = std::mem::take(&mut *self.shared.pending.lock().expect("pending-bind mutex poisoned"));
        let cycle = controllers.iter().map(RegionController::cycle).max().unwrap_or(0);

        for (id, endpoint) in pending {
            let mut controller = RegionController::new(id, endpoint, &self.config);
            controller.start(cycle);
            selector.add_watch(controller.file_descriptor(), SelectorToken::Region(id));
            tracing::debug!(region = %id, cycle = %cycle, "region bound");
            controllers.push(controller);
        }
    }

    fn synchronize(&self, controllers: &mut Vec<RegionController>) {
        if self.shared.shutdown_requested.load(Ordering::Acquire) && controllers.iter().all(RegionController::is_quiescent) {
            for controller in controllers.iter_mut() {
                controller.request_stop();
            }
        }

        loop {
            let before = RegionControllerCensus::observe(controllers);

            region_controller::route_operations(controllers, &self.manager, &self.config);

            for controller in controllers.iter_mut() {
                controller.synchronize(&before);
            }

            for controller in controllers.iter_mut() {
                if let Some(message) = controller.take_outgoing() {
                    controller.send_outgoing(message);
                }
            }

            let after = RegionControllerCensus::observe(controllers);
            if after == before {
                return;
            }
        }
    }

    fn retire_shutdown_controllers(&self, controllers: &mut Vec<RegionController>, selector: &mut Selector) {
        let mut index = 0;
        while index < controllers.len() {
            if controllers[index].is_shutdown() {
                let controller = controllers.remove(index);
                selector.delete_watch(controller.file_descriptor());
                tracing::debug!(region = controller.id(), "region shut down");
            } else {
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_assigns_increasing_region_ids() {
        let domain = Domain::new(Config::default()).unwrap();
        let (first, _) = domain.bind().unwrap();
        let (second, _) = domain.bind().unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }

    #[test]
    fn request_shutdown_is_idempotent() {
        let domain = Domain::new(Config::default()).unwrap();
        domain.request_shutdown();
        domain.request_shutdown();
    }
}
