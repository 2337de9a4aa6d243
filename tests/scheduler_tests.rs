// Integration tests for the migration cycle scheduler
mod common;

use churn::migration::SkipReason;
use churn::scheduler::SchedulerState;
use churn::{ChurnError, CycleScheduler, MigrationError};
use common::{Event, FakeCluster, run_state, settings};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_two_vms_two_hosts_single_worker() {
    let cluster = Arc::new(FakeCluster::new(
        &["hostA", "hostB"],
        &[("vm1", "hostA"), ("vm2", "hostB")],
    ));
    let run = run_state(&["vm1", "vm2"], &["hostA", "hostB"], settings(1, Duration::ZERO, None));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.cycle, 1);
    assert_eq!(report.submitted, 2);
    assert_eq!(report.outcomes(), 2);
    assert_eq!(report.succeeded, 2);

    let calls = cluster.calls();
    assert_eq!(calls.len(), 2);
    for call in &calls {
        assert_ne!(Some(call.destination.clone()), call.source);
    }
    assert_eq!(cluster.host_of("vm1").as_deref(), Some("hostB"));
    assert_eq!(cluster.host_of("vm2").as_deref(), Some("hostA"));
    assert_eq!(cluster.peak(), 1);
}

#[tokio::test]
async fn test_cycles_never_overlap() {
    let vms = ["vm1", "vm2", "vm3", "vm4"];
    let placement: Vec<(&str, &str)> = vms.iter().map(|vm| (*vm, "hostA")).collect();
    let cluster = Arc::new(
        FakeCluster::new(&["hostA", "hostB", "hostC"], &placement)
            .with_delay(Duration::from_millis(10)),
    );
    let run = run_state(&vms, &["hostA", "hostB", "hostC"], settings(3, Duration::ZERO, Some(3)));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.cycles, 3);
    assert_eq!(summary.succeeded, 12);

    let (mut started, mut ended) = (0, 0);
    for event in cluster.events() {
        match event {
            Event::Start(_) => {
                if started % vms.len() == 0 {
                    assert_eq!(started, ended, "cycle began before the previous one drained");
                }
                started += 1;
            }
            Event::End(_) => ended += 1,
        }
    }
    assert_eq!((started, ended), (12, 12));
}

#[tokio::test]
async fn test_concurrency_never_exceeds_workers() {
    let vms: Vec<String> = (0..10).map(|i| format!("vm{}", i)).collect();
    let names: Vec<&str> = vms.iter().map(String::as_str).collect();
    let placement: Vec<(&str, &str)> = names.iter().map(|vm| (*vm, "hostA")).collect();
    let cluster = Arc::new(
        FakeCluster::new(&["hostA", "hostB"], &placement).with_delay(Duration::from_millis(20)),
    );
    let run = run_state(&names, &["hostA", "hostB"], settings(3, Duration::ZERO, Some(2)));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    scheduler.run().await.unwrap();
    assert!(cluster.peak() <= 3, "peak concurrency was {}", cluster.peak());
    assert!(cluster.peak() >= 1);
    assert_eq!(cluster.migrate_calls(), 20);
}

#[tokio::test]
async fn test_worker_count_capped_at_vm_count() {
    let cluster = Arc::new(
        FakeCluster::new(&["hostA", "hostB"], &[("vm1", "hostA"), ("vm2", "hostA")])
            .with_delay(Duration::from_millis(10)),
    );
    let run = run_state(&["vm1", "vm2"], &["hostA", "hostB"], settings(5, Duration::ZERO, Some(1)));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    assert_eq!(scheduler.gate().capacity(), 2);
    scheduler.run().await.unwrap();
    assert!(cluster.peak() <= 2);
}

#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

#[tokio::test]
async fn test_worker_adjustment_logged_once() {
    let capture = LogCapture::default();
    let subscriber = {
        let capture = capture.clone();
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || capture.clone())
            .finish()
    };
    let _guard = tracing::subscriber::set_default(subscriber);

    let cluster = Arc::new(FakeCluster::new(
        &["hostA", "hostB"],
        &[("vm1", "hostA"), ("vm2", "hostB")],
    ));
    let run = run_state(&["vm1", "vm2"], &["hostA", "hostB"], settings(5, Duration::ZERO, Some(1)));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());
    scheduler.run().await.unwrap();

    let logs = capture.contents();
    assert_eq!(
        logs.matches("can not be higher than amount of VMs").count(),
        1,
        "logs were:\n{}",
        logs
    );
    assert!(logs.contains("setting amount of workers to 2"));
    assert!(logs.contains("Cycle 1 finished"));
}

#[tokio::test]
async fn test_single_host_skips_everything() {
    let cluster = Arc::new(FakeCluster::new(
        &["hostA"],
        &[("vm1", "hostA"), ("vm2", "hostA")],
    ));
    let run = run_state(&["vm1", "vm2"], &["hostA"], settings(2, Duration::ZERO, Some(3)));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.cycles, 3);
    assert_eq!(summary.skipped, 6);
    assert_eq!(summary.succeeded + summary.failed, 0);
    assert_eq!(cluster.migrate_calls(), 0);
}

#[tokio::test]
async fn test_failures_are_isolated_per_task() {
    let cluster = Arc::new(FakeCluster::new(
        &["hostA", "hostB"],
        &[("vm1", "hostA"), ("vm2", "hostA")],
    ));
    cluster.fail(
        "vm2",
        MigrationError::InsufficientResources("not enough memory".to_string()),
    );
    let run = run_state(&["vm1", "vm2"], &["hostA", "hostB"], settings(2, Duration::ZERO, Some(2)));
    let vm2 = run.vms[1].clone();
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.cycles, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(cluster.host_of("vm2").as_deref(), Some("hostA"));
    // A failed migration leaves the VM's placement to be re-queried.
    assert_eq!(vm2.cached_host(), None);
}

#[tokio::test]
async fn test_powered_off_vm_skipped() {
    let cluster = Arc::new(FakeCluster::new(
        &["hostA", "hostB"],
        &[("vm1", "hostA"), ("vm2", "hostA")],
    ));
    cluster.power_off("vm2");
    let run = run_state(&["vm1", "vm2"], &["hostA", "hostB"], settings(1, Duration::ZERO, None));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped, 1);
    assert!(cluster.calls().iter().all(|call| call.vm == "vm1"));
}

#[tokio::test]
async fn test_unclassified_engine_error_is_fatal() {
    let cluster = Arc::new(FakeCluster::new(&["hostA", "hostB"], &[("vm1", "hostA")]));
    cluster.fail("vm1", MigrationError::Unclassified("engine vanished".to_string()));
    let run = run_state(&["vm1"], &["hostA", "hostB"], settings(1, Duration::ZERO, None));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    match scheduler.run().await {
        Err(ChurnError::Engine(reason)) => assert_eq!(reason, "engine vanished"),
        other => panic!("expected a fatal engine error, got {:?}", other),
    }
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn test_inventory_error_is_fatal() {
    let cluster = Arc::new(FakeCluster::new(&["hostA", "hostB"], &[("vm1", "hostA")]));
    cluster.fail_status("daemon unreachable");
    let run = run_state(&["vm1"], &["hostA", "hostB"], settings(1, Duration::ZERO, Some(3)));
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    match scheduler.run().await {
        Err(ChurnError::Inventory(reason)) => assert_eq!(reason, "daemon unreachable"),
        other => panic!("expected a fatal inventory error, got {:?}", other),
    }
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert_eq!(scheduler.cycles_completed(), 0);
    assert_eq!(cluster.migrate_calls(), 0);
}

#[tokio::test]
async fn test_stop_during_draining_finishes_in_flight() {
    let cluster = Arc::new(
        FakeCluster::new(
            &["hostA", "hostB"],
            &[("vm1", "hostA"), ("vm2", "hostA"), ("vm3", "hostA")],
        )
        .with_delay(Duration::from_millis(200)),
    );
    let run = run_state(
        &["vm1", "vm2", "vm3"],
        &["hostA", "hostB"],
        settings(1, Duration::ZERO, None),
    );
    let stop = run.stop.clone();
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.request();
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("scheduler should stop")
        .unwrap();

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(cluster.migrate_calls(), 1);
    assert_eq!(cluster.events().last(), Some(&Event::End("vm1".to_string())));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn test_stop_during_sleep_ends_run() {
    let cluster = Arc::new(FakeCluster::new(&["hostA", "hostB"], &[("vm1", "hostA")]));
    let run = run_state(&["vm1"], &["hostA", "hostB"], settings(1, Duration::from_secs(3600), None));
    let stop = run.stop.clone();
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.request();
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("sleep should be interrupted")
        .unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(scheduler.cycles_completed(), 1);
}

#[tokio::test]
async fn test_stop_before_start_runs_nothing() {
    let cluster = Arc::new(FakeCluster::new(&["hostA", "hostB"], &[("vm1", "hostA")]));
    let run = run_state(&["vm1"], &["hostA", "hostB"], settings(1, Duration::ZERO, None));
    run.stop.request();
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster.clone());

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.cycles, 0);
    assert_eq!(cluster.migrate_calls(), 0);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[test]
fn test_skip_reason_display() {
    assert_eq!(SkipReason::NoEligibleTarget.to_string(), "no eligible target host");
}
