//! Results store persistence across daemon restarts.
//!
//! Runs in real time: the redb store works on blocking threads, which a
//! paused clock would race.
//!
//! # Acceptance Criteria
//!
//! - Every cycle leaves one finalized record in the database file
//! - A restarted cell resumes the serial and day id from the latest record
//! - Settings seeded on first open are kept on later opens

use super::common::{test_config, Cell};
use cell_common::config::CellConfig;
use cell_common::{GradePolicy, RecordResult};
use cell_fieldbus::PlcBehaviour;
use cell_runtime::{CellStore, RedbStore};
use std::sync::Arc;
use std::time::Duration;

fn fast_config(dir: &std::path::Path) -> CellConfig {
    let mut config = test_config(dir);
    config.cycle.pre_cycle_delay = Duration::from_millis(10);
    config.cycle.poll_interval = Duration::from_millis(5);
    config.cycle.image_wait = Duration::from_millis(20);
    config.cycle.settle_time = Duration::from_millis(20);
    config.cycle.retry_delay = Duration::from_millis(10);
    config.cycle.step_timeout = Duration::from_secs(10);
    config
}

fn fast_plc(config: &CellConfig) -> PlcBehaviour {
    PlcBehaviour {
        part_interval: Duration::from_millis(30),
        ack_delay: Duration::from_millis(10),
        final_hold: config.cycle.image_wait + Duration::from_millis(200),
        poll_interval: Duration::from_millis(5),
        ..PlcBehaviour::default()
    }
}

#[tokio::test]
async fn test_counters_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let store_path = config.store.path.clone();

    // First run: one good part.
    let store = Arc::new(RedbStore::open(&store_path, &config.settings).unwrap());
    let (cell, mut orchestrator) = Cell::build(dir, config.clone(), Arc::clone(&store), 1);
    cell.scanner.push_reading("0");
    cell.scanner.push_reading("240615XX0007A");
    cell.place_image("240615XX0007");
    cell.start_plc(fast_plc(&config));

    orchestrator.initialize().await.unwrap();
    let stats = orchestrator.run(cell.shutdown_signal()).await;
    assert_eq!(stats.completed, 1);
    store.close().await.unwrap();
    drop(orchestrator);
    drop(store);

    // Second run against the same database file.
    let mut seed = config.settings.clone();
    seed.grade = GradePolicy::new("A");
    let store = Arc::new(RedbStore::open(&store_path, &seed).unwrap());
    assert_eq!(store.grade_policy().await.unwrap(), config.settings.grade);

    let restarted_dir = tempfile::tempdir().unwrap();
    let (restarted, mut orchestrator) = Cell::build(restarted_dir, config.clone(), Arc::clone(&store), 1);
    restarted.scanner.push_reading("0");
    restarted.scanner.push_reading("240615XX0008A");
    restarted.place_image("240615XX0008");
    restarted.start_plc(fast_plc(&config));

    orchestrator.initialize().await.unwrap();
    assert_eq!(orchestrator.serial().current(), 8);
    assert_eq!(orchestrator.day_ids().last_issued(), 1);

    let stats = orchestrator.run(restarted.shutdown_signal()).await;
    assert_eq!(stats.completed, 1);

    let records = store.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].serial_number, "0007");
    assert_eq!(records[1].serial_number, "0008");
    assert_eq!(records[1].marking_data, "240615XX0008");
    assert_eq!(records[1].day_id, 2);
    assert!(records.iter().all(|r| r.result == RecordResult::Ok));

    let latest = store.latest_record().await.unwrap().unwrap();
    assert_eq!(latest, records[1]);
    drop(cell);
}
