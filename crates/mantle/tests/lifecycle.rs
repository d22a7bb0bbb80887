//! End-to-end exercises of the bind/increment/decrement/finalize round trip
//! through a real [`Domain`] and [`Region`] pair on live OS threads, using
//! the [`support::handle`] reference smart pointer rather than raw
//! `increment`/`decrement` calls.

mod support;

use mantle::finalizer::FnFinalizer;
use mantle::object::Object;
use mantle::{Config, Region};
use support::handle::{HasHeader, Handle};
use support::runtime::TestDomain;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[repr(C)]
struct Counted {
    header: Object,
}

unsafe impl HasHeader for Counted {
    fn header(&self) -> &Object {
        &self.header
    }
}

fn counting_finalizer(counter: Arc<AtomicUsize>) -> FnFinalizer<impl FnMut(mantle::ObjectGroup, &[*mut Object]) + Send> {
    FnFinalizer::new(move |_group, objects| {
        counter.fetch_add(objects.len(), Ordering::SeqCst);
        for &object in objects {
            // SAFETY: every object handed to this finalizer was allocated
            // as a `Counted` via `Box::into_raw` in the test below.
            unsafe {
                drop(Box::from_raw(object.cast::<Counted>()));
            }
        }
    })
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn single_handle_bind_and_drop_finalizes_once() {
    let finalized = Arc::new(AtomicUsize::new(0));
    let domain = TestDomain::spawn(Config::default());

    let finalized_clone = Arc::clone(&finalized);
    domain
        .spawn_region(counting_finalizer(finalized_clone), |region: &Region| {
            let handle = Handle::bind(Box::new(Counted { header: Object::new(0) }));
            assert_eq!(handle.get().header.reference_count(), 0);
            drop(handle);

            for _ in 0..8 {
                region.step(true);
            }
        })
        .join()
        .unwrap();

    wait_for(|| finalized.load(Ordering::SeqCst) == 1);
}

#[test]
fn shared_ownership_survives_until_last_copy_drops() {
    let finalized = Arc::new(AtomicUsize::new(0));
    let domain = TestDomain::spawn(Config::default());

    let finalized_clone = Arc::clone(&finalized);
    domain
        .spawn_region(counting_finalizer(finalized_clone), |region: &Region| {
            let original = Handle::bind(Box::new(Counted { header: Object::new(0) }));
            let copies: Vec<_> = (0..3).map(|_| original.clone()).collect();

            for _ in 0..4 {
                region.step(true);
            }

            drop(copies);
            drop(original);

            for _ in 0..8 {
                region.step(true);
            }
        })
        .join()
        .unwrap();

    wait_for(|| finalized.load(Ordering::SeqCst) == 1);
}

#[test]
fn cross_region_transfer_routes_decrement_to_the_owning_region() {
    let finalized = Arc::new(AtomicUsize::new(0));
    let domain = TestDomain::spawn(Config::default());

    let (tx, rx) = std::sync::mpsc::channel();

    let finalized_a = Arc::clone(&finalized);
    let producer = domain.spawn_region(counting_finalizer(finalized_a), move |region: &Region| {
        let handle = Handle::bind(Box::new(Counted { header: Object::new(0) }));
        tx.send(handle).unwrap();

        // Keep stepping so this region's SUBMIT/RETIRE participation
        // continues servicing the domain while the other region holds a
        // reference bound to this one.
        for _ in 0..16 {
            region.step(true);
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    let finalized_b = Arc::clone(&finalized);
    let consumer = domain.spawn_region(counting_finalizer(finalized_b), move |region: &Region| {
        let handle = rx.recv().unwrap();
        for _ in 0..4 {
            region.step(true);
        }
        drop(handle);
        for _ in 0..8 {
            region.step(true);
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();

    wait_for(|| finalized.load(Ordering::SeqCst) == 1);
}
