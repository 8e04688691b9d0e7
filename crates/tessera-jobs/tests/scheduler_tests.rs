//! Behavioural tests for the job scheduler.
//!
//! Set `RUST_LOG=tessera_jobs=trace` to see scheduler events while a test
//! runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use tessera_jobs::prelude::*;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn workers(n: usize) -> SchedulerConfig {
    SchedulerConfig {
        worker_count: Some(n),
        ..Default::default()
    }
}

#[test]
fn later_job_completes_before_blocked_earlier_ones() {
    init_tracing();
    let scheduler = JobScheduler::new(workers(3)).unwrap();
    let (release_1, gate_1) = channel::bounded::<()>(0);
    let (release_2, gate_2) = channel::bounded::<()>(0);

    let h1 = scheduler
        .schedule(move || {
            let _ = gate_1.recv();
        })
        .unwrap();
    let h2 = scheduler
        .schedule(move || {
            let _ = gate_2.recv();
        })
        .unwrap();
    let h3 = scheduler.schedule(|| {}).unwrap();
    let h4 = scheduler.schedule(|| {}).unwrap();
    let h5 = scheduler.schedule(|| {}).unwrap();
    assert_eq!(h3.id(), 3);

    // Jobs 1 and 2 each hold a worker; the third worker runs 3, 4 and 5.
    h3.wait_for_completion();
    h5.wait_for_completion();
    assert!(h4.is_completed());
    assert!(!h1.is_completed());
    assert!(!h2.is_completed());
    assert_eq!(scheduler.low_water_mark(), 1);

    release_1.send(()).unwrap();
    h1.wait_for_completion();
    assert_eq!(scheduler.low_water_mark(), 2);
    assert!(!h2.is_completed());

    release_2.send(()).unwrap();
    h2.wait_for_completion();
    scheduler.wait_idle();
    // 2 finished last, so the mark jumps straight past 3..5.
    assert_eq!(scheduler.low_water_mark(), 6);
}

#[test]
fn dispose_runs_queued_jobs_before_returning() {
    init_tracing();
    let scheduler = JobScheduler::new(workers(1)).unwrap();
    let (release, gate) = channel::bounded::<()>(0);
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    scheduler
        .schedule(move || {
            let _ = gate.recv();
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let queued: Vec<JobHandle> = (0..2)
        .map(|_| {
            let counter = ran.clone();
            scheduler
                .schedule(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        })
        .collect();

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        release.send(()).unwrap();
    });
    scheduler.dispose();
    releaser.join().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert!(queued.iter().all(JobHandle::is_completed));
    assert_eq!(scheduler.state(), SchedulerState::Disposed);
    assert_eq!(scheduler.queued(), 0);
}

#[test]
fn submissions_during_draining_are_refused() {
    init_tracing();
    let scheduler = Arc::new(JobScheduler::new(workers(1)).unwrap());
    let (release, gate) = channel::bounded::<()>(0);
    let (started_tx, started) = channel::bounded::<()>(1);
    scheduler
        .schedule(move || {
            started_tx.send(()).unwrap();
            let _ = gate.recv();
        })
        .unwrap();
    started.recv().unwrap();

    let disposer = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.dispose())
    };
    while scheduler.state() == SchedulerState::Running {
        thread::yield_now();
    }
    assert!(matches!(scheduler.schedule(|| {}), Err(SchedulerError::Draining)));

    release.send(()).unwrap();
    disposer.join().unwrap();
    assert!(matches!(scheduler.schedule(|| {}), Err(SchedulerError::Disposed)));
}

#[test]
fn id_overflow_drains_and_bumps_version() {
    init_tracing();
    let scheduler = JobScheduler::new(SchedulerConfig {
        worker_count: Some(2),
        id_limit: 4,
        ..Default::default()
    })
    .unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let handles: Vec<JobHandle> = (0..10)
        .map(|_| {
            let counter = ran.clone();
            scheduler
                .schedule(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        })
        .collect();

    // Resets happen before the 5th and 9th submissions.
    let ids: Vec<u64> = handles.iter().map(JobHandle::id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 1, 2, 3, 4, 1, 2]);
    let versions: Vec<u32> = handles.iter().map(JobHandle::version).collect();
    assert_eq!(versions, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2]);
    assert_eq!(scheduler.version(), 2);

    // Everything from a previous version ran before the reset.
    assert!(ran.load(Ordering::SeqCst) >= 8);
    assert!(handles[..8].iter().all(JobHandle::is_completed));

    for handle in &handles {
        handle.wait_for_completion();
    }
    scheduler.wait_idle();
    assert_eq!(ran.load(Ordering::SeqCst), 10);
}

#[test]
fn randomized_durations_all_complete() {
    init_tracing();
    const JOBS: usize = 500;
    let scheduler = JobScheduler::new(workers(4)).unwrap();
    let mut rng = Pcg64::seed_from_u64(42);
    let ran = Arc::new(AtomicUsize::new(0));

    let handles: Vec<JobHandle> = (0..JOBS)
        .map(|_| {
            let delay = Duration::from_micros(rng.gen_range(0..200));
            let counter = ran.clone();
            scheduler
                .schedule(move || {
                    thread::sleep(delay);
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        })
        .collect();

    // Poll in reverse so later jobs are checked before earlier ones.
    for handle in handles.iter().rev() {
        handle.wait_for_completion();
    }
    assert_eq!(ran.load(Ordering::SeqCst), JOBS);
    scheduler.wait_idle();
    assert_eq!(scheduler.low_water_mark(), JOBS as u64 + 1);
}

#[test]
fn jobs_can_be_scheduled_from_many_threads() {
    init_tracing();
    let scheduler = JobScheduler::new(workers(2)).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut ids: Vec<u64> = thread::scope(|s| {
        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = &scheduler;
                let ran = &ran;
                s.spawn(move || {
                    (0..50)
                        .map(|_| {
                            let counter = Arc::clone(ran);
                            scheduler
                                .schedule(move || {
                                    counter.fetch_add(1, Ordering::SeqCst);
                                })
                                .unwrap()
                                .id()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        submitters
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    scheduler.wait_idle();
    assert_eq!(ran.load(Ordering::SeqCst), 200);
    ids.sort_unstable();
    assert_eq!(ids, (1..=200).collect::<Vec<_>>());
}

#[test]
fn config_round_trips_through_json() {
    let config = SchedulerConfig {
        worker_count: Some(3),
        id_limit: 1_000,
        thread_name_prefix: "bg".into(),
    };
    let json = serde_json::to_string(&config).unwrap();
    let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);

    let partial: SchedulerConfig = serde_json::from_str(r#"{"worker_count": 2}"#).unwrap();
    assert_eq!(partial.id_limit, SchedulerConfig::default().id_limit);
    assert_eq!(partial.resolved_worker_count(), 2);
}
