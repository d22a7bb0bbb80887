//! Test harness wiring a [`Domain`] and one or more [`Region`]s together on
//! real OS threads, the way a host embedding this crate would.

use mantle::domain::Domain;
use mantle::region::Region;
use mantle::{Config, Finalizer};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Owns the domain thread and joins it on drop.
pub struct TestDomain {
    domain: Arc<Domain>,
    thread: Option<JoinHandle<()>>,
}

impl TestDomain {
    pub fn spawn(config: Config) -> Self {
        let domain = Arc::new(Domain::new(config).expect("domain construction"));
        let run_domain = Arc::clone(&domain);
        let thread = thread::Builder::new()
            .name("mantle-domain".into())
            .spawn(move || run_domain.run().expect("domain loop"))
            .expect("spawn domain thread");
        Self { domain, thread: Some(thread) }
    }

    #[must_use]
    pub fn handle(&self) -> Arc<Domain> {
        Arc::clone(&self.domain)
    }

    /// Spawns a worker thread that binds a region, runs `body` on it, then
    /// drains the region to a clean stop before returning.
    pub fn spawn_region<F>(&self, finalizer: impl Finalizer + 'static, body: F) -> JoinHandle<()>
    where
        F: FnOnce(&Region) + Send + 'static,
    {
        let domain = Arc::clone(&self.domain);
        thread::Builder::new()
            .name("mantle-region".into())
            .spawn(move || {
                let manager = domain.write_barrier_manager();
                let region = Region::new(&domain, manager, Box::new(finalizer)).expect("region bind");

                body(&region);

                region.stop();
                while !region.is_stopped() {
                    region.step(false);
                }
            })
            .expect("spawn region thread")
    }
}

impl Drop for TestDomain {
    fn drop(&mut self) {
        self.domain.request_shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("domain thread panicked");
        }
    }
}
