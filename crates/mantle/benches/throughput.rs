use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mantle::domain::Domain;
use mantle::finalizer::FnFinalizer;
use mantle::object::Object;
use mantle::region::Region;
use mantle::Config;
use std::sync::Arc;
use std::thread;

const OBJECTS_PER_REGION: u64 = 50_000;

/// Binds `OBJECTS_PER_REGION` objects on one region, each with one
/// increment and one matching decrement, and steps until every one has been
/// finalized.
fn run_one_region(config: Config) {
    let domain = Arc::new(Domain::new(config).unwrap());
    let domain_thread = {
        let domain = Arc::clone(&domain);
        thread::spawn(move || domain.run().unwrap())
    };

    let worker = {
        let domain = Arc::clone(&domain);
        thread::spawn(move || {
            let manager = domain.write_barrier_manager();
            let finalizer = FnFinalizer::new(|_group, objects| {
                for &object in objects {
                    // SAFETY: every object below was allocated with
                    // `Box::into_raw::<Object>` and nothing else holds it.
                    unsafe {
                        drop(Box::from_raw(object));
                    }
                }
            });
            let region = Region::new(&domain, manager, Box::new(finalizer)).unwrap();

            for _ in 0..OBJECTS_PER_REGION {
                let object = Box::into_raw(Box::new(Object::new(0)));
                region.bind_object(unsafe { &*object });
                region.increment(object);
                region.decrement(object);
                region.step(true);
            }

            region.stop();
            while !region.is_stopped() {
                region.step(false);
            }
        })
    };

    worker.join().unwrap();
    domain.request_shutdown();
    domain_thread.join().unwrap();
}

fn bench_single_region(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_region");
    group.throughput(Throughput::Elements(OBJECTS_PER_REGION));
    group.sample_size(10);

    group.bench_function("bind_increment_decrement", |b| {
        b.iter(|| run_one_region(Config::default()));
    });

    group.finish();
}

fn bench_segment_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_capacity");
    group.throughput(Throughput::Elements(OBJECTS_PER_REGION));
    group.sample_size(10);

    for capacity in [2 * 1024usize, 16 * 1024, 64 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            let config = Config::new(capacity, true, true);
            b.iter(|| run_one_region(config));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_region, bench_segment_capacity);
criterion_main!(benches);
