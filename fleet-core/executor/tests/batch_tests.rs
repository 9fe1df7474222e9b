//! 批量执行器测试

mod common;

use std::sync::Arc;

use common::{off, on, reachable, settings, FakeHypervisor};
use fleet_executor::{
    BatchExecutor, BatchRequest, FleetConfig, Operation, OperationStatus, ProgressEvent, VmConfig,
    WorkItem,
};
use fleet_transport::{DeviceKind, PowerState, SnapshotId, SnapshotNode, SnapshotTree};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn executor(fake: &FakeHypervisor, fleet: FleetConfig) -> BatchExecutor {
    BatchExecutor::new(Arc::new(fake.clone()), fleet, settings()).with_pinger(reachable())
}

fn clone_config() -> VmConfig {
    let mut config = VmConfig::new("web-01");
    config.source_vm = Some("template".to_string());
    config.datastore = Some("fast-ssd".to_string());
    config.source_snapshot = Some("golden".to_string());
    config.cpu_count = Some(4);
    config.memory_mb = Some(8192);
    config
}

fn template() -> common::FakeVm {
    on("tpl").with_snapshots(SnapshotTree {
        roots: vec![SnapshotNode::new("g1", "golden")],
        current: None,
    })
}

#[tokio::test(start_paused = true)]
async fn test_missing_vm_does_not_stop_batch() {
    let fake = FakeHypervisor::new().with_vm("web-01", on("vm-1"));
    let items = vec![
        WorkItem::new("ghost", vec![Operation::PowerOn, Operation::Snapshot { name: None }]),
        WorkItem::new("web-01", vec![Operation::PowerOff]),
    ];

    let report = executor(&fake, FleetConfig::default())
        .run(items, CancellationToken::new())
        .await;

    assert_eq!(report.total_operations, 3);
    assert_eq!(report.success_count, 1);
    assert_eq!(report.status("ghost", "poweron"), Some(OperationStatus::Error));
    assert_eq!(report.status("ghost", "snapshot"), Some(OperationStatus::Error));
    assert_eq!(report.status("web-01", "poweroff"), Some(OperationStatus::Success));
    assert_eq!(report.vm_errors["ghost"].len(), 2);
    assert!(report.errors.iter().all(|e| e.contains("ghost") && e.contains("不存在")));
    assert_eq!(report.summary().failed_vms, vec!["ghost"]);
    assert_eq!(fake.power("web-01"), PowerState::PoweredOff);
    assert_eq!(fake.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poweroff_snapshot_poweron_end_to_end() {
    let fake = FakeHypervisor::new().with_vm("web-01", on("vm-1"));
    let items = vec![WorkItem::new(
        "web-01",
        vec![
            Operation::PowerOff,
            Operation::Snapshot {
                name: Some("nightly".to_string()),
            },
            Operation::PowerOn,
        ],
    )];

    let report = executor(&fake, FleetConfig::default())
        .run(items, CancellationToken::new())
        .await;

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(report.success_count, 3);
    assert_eq!(fake.power("web-01"), PowerState::PoweredOn);
    assert_eq!(
        fake.calls(),
        vec![
            "shutdown_guest:web-01",
            "create_snapshot:web-01",
            "power_on:web-01"
        ]
    );
    let snapshots = fake.vm("web-01").unwrap().snapshots;
    assert_eq!(snapshots.roots[0].name, "nightly");
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_marks_remaining_interrupted() {
    let fake = FakeHypervisor::new()
        .with_vm("web-01", on("vm-1"))
        .with_vm("web-02", on("vm-2"));
    let items = vec![
        WorkItem::new(
            "web-01",
            vec![Operation::PowerOff, Operation::Snapshot { name: Some("s".to_string()) }],
        ),
        WorkItem::new("web-02", vec![Operation::PowerOff, Operation::PowerOn]),
    ];

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let batch = executor(&fake, FleetConfig::default()).with_progress(tx);

    // 第一个操作完成后取消
    let trigger = cancel.clone();
    let watcher = async move {
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::Status {
                status: OperationStatus::Success,
                ..
            } = event
            {
                trigger.cancel();
            }
        }
    };

    let (report, ()) = tokio::join!(
        async {
            let report = batch.run(items, cancel.clone()).await;
            drop(batch);
            report
        },
        watcher
    );

    assert_eq!(report.status("web-01", "poweroff"), Some(OperationStatus::Success));
    // 已开始的操作执行完毕
    assert_eq!(report.status("web-01", "snapshot"), Some(OperationStatus::Success));
    assert_eq!(report.status("web-02", "poweroff"), Some(OperationStatus::Interrupted));
    assert_eq!(report.status("web-02", "poweron"), Some(OperationStatus::Interrupted));
    assert_eq!(report.summary().interrupted, 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.vm_errors.is_empty());
    assert_eq!(fake.power("web-02"), PowerState::PoweredOn);
    assert!(!fake.calls().iter().any(|c| c.ends_with("web-02")));
    assert_eq!(fake.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start() {
    let fake = FakeHypervisor::new().with_vm("web-01", on("vm-1"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = executor(&fake, FleetConfig::default())
        .run(vec![WorkItem::new("web-01", vec![Operation::PowerOff])], cancel)
        .await;

    assert_eq!(report.status("web-01", "poweroff"), Some(OperationStatus::Interrupted));
    assert_eq!(report.success_count, 0);
    assert!(fake.calls().is_empty());
    assert_eq!(fake.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clone_applies_overrides_with_monotonic_progress() {
    let fake = FakeHypervisor::new().with_vm("template", template());
    fake.set(|s| s.clone_progress = vec![None, Some(10), Some(5), None, Some(60), Some(95)]);
    let fleet = FleetConfig::from_vms(vec![clone_config()]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let report = executor(&fake, fleet)
        .with_progress(tx)
        .run(vec![WorkItem::new("web-01", vec![Operation::Clone])], CancellationToken::new())
        .await;

    assert!(report.is_success(), "errors: {:?}", report.errors);

    let cloned = fake.vm("web-01").unwrap();
    assert_eq!(cloned.power, PowerState::PoweredOff);
    assert_eq!(cloned.num_cpus, Some(4));
    assert_eq!(cloned.memory_mb, Some(8192));

    let source = fake.vm("template").unwrap();
    assert_eq!(source.power, PowerState::PoweredOff);
    assert_eq!(source.snapshots.current, Some(SnapshotId("g1".to_string())));
    assert!(source
        .devices
        .iter()
        .all(|d| !matches!(d.kind, DeviceKind::CdRom { connected: true })));

    let mut progress = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::CloneProgress { vm, percent } = event {
            assert_eq!(vm, "web-01");
            progress.push(percent);
        }
    }
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test(start_paused = true)]
async fn test_clone_failures_are_per_operation() {
    let fake = FakeHypervisor::new().with_vm("template", template());
    let mut bad_datastore = clone_config();
    bad_datastore.name = "web-02".to_string();
    bad_datastore.datastore = Some("slow-hdd".to_string());
    let mut no_source = clone_config();
    no_source.name = "web-03".to_string();
    no_source.source_vm = Some("missing-template".to_string());
    let fleet = FleetConfig::from_vms(vec![bad_datastore, no_source, clone_config()]);

    let items = vec![
        WorkItem::new("web-02", vec![Operation::Clone]),
        WorkItem::new("web-03", vec![Operation::Clone]),
        WorkItem::new("web-04", vec![Operation::Clone]),
        WorkItem::new("web-01", vec![Operation::Clone]),
    ];
    let report = executor(&fake, fleet).run(items, CancellationToken::new()).await;

    assert!(report.vm_errors["web-02"][0].contains("slow-hdd"));
    assert!(report.vm_errors["web-03"][0].contains("missing-template"));
    assert!(report.vm_errors.contains_key("web-04"));
    assert_eq!(report.status("web-01", "clone"), Some(OperationStatus::Success));
    assert!(fake.vm("web-02").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_delete_and_hardware() {
    let fake = FakeHypervisor::new()
        .with_vm("old-01", on("vm-1"))
        .with_vm("web-01", off("vm-2"));
    let mut config = VmConfig::new("web-01");
    config.cpu_count = Some(8);
    config.network = Some("prod".to_string());
    let fleet = FleetConfig::from_vms(vec![config]);

    let items = vec![
        WorkItem::new("old-01", vec![Operation::Delete]),
        WorkItem::new("web-01", vec![Operation::Hardware]),
    ];
    let report = executor(&fake, fleet).run(items, CancellationToken::new()).await;

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert!(fake.vm("old-01").is_none());
    let web = fake.vm("web-01").unwrap();
    assert_eq!(web.num_cpus, Some(8));
    assert_eq!(web.power, PowerState::PoweredOff);
}

#[tokio::test(start_paused = true)]
async fn test_forced_poweroff_failure_is_operation_error() {
    let fake = FakeHypervisor::new().with_vm("web-01", on("vm-1").without_tools());
    fake.set(|s| s.fail_force_off = true);

    let report = executor(&fake, FleetConfig::default())
        .run(
            vec![WorkItem::new("web-01", vec![Operation::PowerOff, Operation::PowerOn])],
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status("web-01", "poweroff"), Some(OperationStatus::Error));
    assert_eq!(report.status("web-01", "poweron"), Some(OperationStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn test_progress_events_in_order() {
    let fake = FakeHypervisor::new().with_vm("web-01", off("vm-1"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    executor(&fake, FleetConfig::default())
        .with_progress(tx)
        .run(vec![WorkItem::new("web-01", vec![Operation::PowerOn])], CancellationToken::new())
        .await;

    let mut statuses = Vec::new();
    while let Ok(ProgressEvent::Status { vm, operation, status }) = rx.try_recv() {
        statuses.push((vm, operation, status));
    }
    assert_eq!(
        statuses,
        vec![
            ("web-01".to_string(), "poweron".to_string(), OperationStatus::Active),
            ("web-01".to_string(), "poweron".to_string(), OperationStatus::Success),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_spawned_batch_from_request() {
    let fake = FakeHypervisor::new().with_vm("web-01", on("vm-1").with_snapshots(SnapshotTree {
        roots: vec![SnapshotNode::new("b1", "baseline")],
        current: None,
    }));
    let request = BatchRequest::from_json(
        r#"{"vmOperations":[{"vm":"web-01","operations":["revert","poweron"]}],"revertName":"baseline"}"#,
    )
    .unwrap();

    let handle = executor(&fake, FleetConfig::default()).spawn(request.into_work_items().unwrap());
    let report = handle.join().await.unwrap();

    assert!(report.is_success(), "errors: {:?}", report.errors);
    assert_eq!(fake.power("web-01"), PowerState::PoweredOn);
    assert_eq!(
        fake.vm("web-01").unwrap().snapshots.current,
        Some(SnapshotId("b1".to_string()))
    );
    assert_eq!(fake.disconnects(), 1);
}
