//! End-to-end exercise of the write path: readings enter the main queue,
//! unknown metrics detour through the create-offload queue, and datapoints
//! land in a date shard that a fresh federator can scan after release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use carbond::audit::Audit;
use carbond::leveltsd::{LevelFederator, LevelTsdAdapter, LevelTsdConfig, ShardConfig};
use carbond::mq::{MetricReading, StoragePipeline};
use carbond::storage::{register_adapter, StorageCore};

fn engine_config(root: &std::path::Path) -> HashMap<String, String> {
    let mut cfg = HashMap::new();
    cfg.insert("root".to_string(), root.to_string_lossy().to_string());
    cfg.insert("write-batch-interval-seconds".to_string(), "1".to_string());
    cfg
}

fn storage_config() -> HashMap<String, String> {
    let mut cfg = HashMap::new();
    cfg.insert("engine".to_string(), "leveltsd".to_string());
    cfg.insert("backlog".to_string(), "1000".to_string());
    cfg.insert("max_write_rpm".to_string(), "1000000".to_string());
    cfg.insert("max_create_rpm".to_string(), "1000".to_string());
    cfg
}

#[test]
fn queue_to_shard_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    register_adapter("leveltsd", Arc::new(LevelTsdAdapter::new()));

    let audit = Audit::new();
    let core = StorageCore::build(&storage_config(), &engine_config(tmp.path()), audit.clone()).unwrap();

    let pipeline = StoragePipeline::new(1000);
    core.dispatch_loop(pipeline.main_rx.clone(), Some(pipeline.offload_tx.clone()), true, 4);
    core.dispatch_loop(pipeline.offload_rx.clone(), None, true, 1);

    // all metrics are unknown at this point, so every reading detours
    // through the offload queue before being created and written
    let readings = [
        MetricReading { metric: "servers.web01.load".into(), value: 3.4, time: 92 },
        MetricReading { metric: "servers.web01.load".into(), value: 4.5, time: 152 },
        MetricReading { metric: "servers.web02.load".into(), value: 1.25, time: 92 },
    ];
    for r in &readings {
        pipeline.main_tx.send(r.clone()).unwrap();
    }

    // wait for the dispatcher to count three successful writes
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let written = audit
            .current()
            .writer
            .datapoints_written
            .load(std::sync::atomic::Ordering::Relaxed);
        if written == 3 {
            break;
        }
        assert!(Instant::now() < deadline, "only {} datapoints written", written);
        std::thread::sleep(Duration::from_millis(25));
    }
    // ... and for the shard writers to pass a flush tick
    std::thread::sleep(Duration::from_millis(2500));
    core.release();

    // a fresh federator over the same root sees everything
    let federator = LevelFederator::open(LevelTsdConfig {
        base_dir: tmp.path().to_path_buf(),
        shard: ShardConfig::default(),
    })
    .unwrap();

    assert_eq!(federator.index().list_children(""), vec!["servers".to_string()]);
    let mut hosts = federator.index().list_children("servers");
    hosts.sort();
    assert_eq!(hosts, vec!["web01".to_string(), "web02".to_string()]);

    let key = federator.get_metric("servers.web01.load").unwrap();
    let points = federator.data_scan(&key, 1, 1000).unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].timestamp, 60);
    assert_eq!(points[0].value, 3.4);
    assert_eq!(points[1].timestamp, 120);
    assert_eq!(points[1].value, 4.5);

    let key = federator.get_metric("servers.web02.load").unwrap();
    let points = federator.data_scan(&key, 1, 1000).unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value, 1.25);

    federator.release();
}
