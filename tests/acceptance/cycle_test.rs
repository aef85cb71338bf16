//! Complete scan cycles against the simulated PLC.
//!
//! # Acceptance Criteria
//!
//! - A good part is marked once, verified, recorded OK, and its image archived
//! - A low grade is retried exactly `second_scan_retries` times, `retry_delay`
//!   apart, before NG
//! - An already-marked part releases the station without a new serial
//! - A missing camera image fails the part and withholds the result bit

use super::common::{drain_event_names, plc_behaviour, wait_for_event, Cell, BARCODE};
use cell_common::{CellEvent, RecordResult, NG};
use cell_runtime::{FIRST_SCAN_OK_MESSAGE, IMAGE_NOT_FOUND, NO_READ_GRADE};
use cell_scanner::ScriptedScanner;
use std::time::Duration;

/// Time between consecutive verification reads.
fn verification_gaps(scanner: &ScriptedScanner) -> Vec<Duration> {
    let times: Vec<_> = scanner
        .calls()
        .into_iter()
        .zip(scanner.call_times())
        .filter(|(second, _)| *second)
        .map(|(_, at)| at)
        .collect();
    times.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn test_good_part_is_marked_and_verified() {
    let (cell, mut orchestrator) = Cell::in_memory(1);
    cell.scanner.push_reading("0");
    cell.scanner.push_reading("240615XX0007A");
    cell.place_image(BARCODE);
    let plc = cell.start_plc(plc_behaviour(&cell.config));
    let mut events = cell.events.subscribe();

    orchestrator.initialize().await.unwrap();
    let stats = orchestrator.run(cell.shutdown_signal()).await;

    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cycle_count(), 1);
    assert_eq!(orchestrator.serial().current(), 8);

    let records = cell.store.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.serial_number, "0007");
    assert_eq!(record.marking_data, BARCODE);
    assert_eq!(record.scanner_data, "240615XX0007A");
    assert_eq!(record.result, RecordResult::Ok);
    assert_eq!(record.grade, "A");
    assert_eq!(record.day_id, 1);
    assert_eq!(record.remark, "");

    let files = &cell.config.files;
    assert_eq!(std::fs::read_to_string(&files.code_file).unwrap(), BARCODE);
    assert_eq!(std::fs::read_to_string(&files.text_file).unwrap(), "150624XX0007");
    assert!(files.backup_dir.join("cam_240615XX0007_1.bmp").exists());
    assert!(!files.camera_dir.join("cam_240615XX0007_1.bmp").exists());

    // Result OK flag written, then the PLC finished the part.
    assert!(cell.regs.writes().contains(&(1417, 1)));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(plc.parts_done(), 1);

    assert_eq!(cell.scanner.calls(), vec![false, true]);
    assert_eq!(
        drain_event_names(&mut events),
        vec!["scanner_read", "marking_data", "scanner_read"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_low_grade_is_retried_twice_then_ng() {
    let (cell, mut orchestrator) = Cell::in_memory(1);
    cell.scanner.push_reading("0");
    for _ in 0..3 {
        cell.scanner.push_reading("240615XX0007C");
    }
    cell.place_image(BARCODE);
    cell.start_plc(plc_behaviour(&cell.config));

    orchestrator.initialize().await.unwrap();
    let stats = orchestrator.run(cell.shutdown_signal()).await;

    assert_eq!(stats.completed, 1);
    // One first read, one verification read, two retries.
    assert_eq!(cell.scanner.calls(), vec![false, true, true, true]);
    assert_eq!(cell.scanner.remaining(), 0);
    assert_eq!(
        verification_gaps(&cell.scanner),
        vec![cell.config.cycle.retry_delay; 2]
    );

    let records = cell.store.records();
    assert_eq!(records[0].result, RecordResult::Ng);
    assert_eq!(records[0].grade, "C");
    assert!(cell.regs.writes().contains(&(1417, 2)));
}

#[tokio::test(start_paused = true)]
async fn test_grade_recovers_on_retry() {
    let (cell, mut orchestrator) = Cell::in_memory(1);
    cell.scanner.push_reading("0");
    cell.scanner.push_reading("0");
    cell.scanner.push_reading("240615XX0007B");
    cell.place_image(BARCODE);
    cell.start_plc(plc_behaviour(&cell.config));

    orchestrator.initialize().await.unwrap();
    orchestrator.run(cell.shutdown_signal()).await;

    assert_eq!(cell.scanner.calls(), vec![false, true, true]);
    assert_eq!(verification_gaps(&cell.scanner), vec![cell.config.cycle.retry_delay]);
    let records = cell.store.records();
    assert_eq!(records[0].result, RecordResult::Ok);
    assert_eq!(records[0].grade, "B");
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_marking_is_ng_with_fail_grade() {
    let (cell, mut orchestrator) = Cell::in_memory(1);
    cell.place_image(BARCODE);
    cell.start_plc(plc_behaviour(&cell.config));

    orchestrator.initialize().await.unwrap();
    orchestrator.run(cell.shutdown_signal()).await;

    let records = cell.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].scanner_data, NG);
    assert_eq!(records[0].result, RecordResult::Ng);
    assert_eq!(records[0].grade, NO_READ_GRADE);
}

#[tokio::test(start_paused = true)]
async fn test_already_marked_part_is_released() {
    let (cell, mut orchestrator) = Cell::in_memory(1);
    cell.scanner.push_reading("240615XX0001A");
    let plc = cell.start_plc(plc_behaviour(&cell.config));
    let mut events = cell.events.subscribe();

    orchestrator.initialize().await.unwrap();
    let stats = orchestrator.run(cell.shutdown_signal()).await;

    assert_eq!(stats.aborted_ok_part, 1);
    assert_eq!(stats.cycle_count(), 0);
    assert!(cell.store.records().is_empty());
    assert_eq!(orchestrator.serial().current(), 7);
    assert!(!cell.config.files.code_file.exists());

    let event = wait_for_event(&mut events, "first_scan_ok").await;
    assert_eq!(
        event,
        CellEvent::FirstScanOk {
            scanner_data: "240615XX0001A".into(),
            message: FIRST_SCAN_OK_MESSAGE.into(),
        }
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(plc.parts_done(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_image_fails_the_part() {
    let (cell, mut orchestrator) = Cell::in_memory(1);
    cell.scanner.push_reading("0");
    cell.scanner.push_reading("240615XX0007A");
    cell.start_plc(plc_behaviour(&cell.config));
    let mut events = cell.events.subscribe();
    let shutdown = cell.shutdown_signal();

    orchestrator.initialize().await.unwrap();
    let run = tokio::spawn(async move { orchestrator.run(shutdown).await });

    match wait_for_event(&mut events, "image_save_error").await {
        CellEvent::ImageSaveError { message, path } => {
            assert!(message.contains(BARCODE));
            assert_eq!(path, cell.config.files.camera_dir.display().to_string());
        }
        other => panic!("unexpected event {other:?}"),
    }

    // No verdict reaches the PLC; the operator releases the part.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let result_register = cell.config.plc.map.result_ok.register;
    assert!(cell
        .regs
        .writes()
        .iter()
        .all(|&(register, value)| register != result_register || value == 0));
    let final_ack = cell.config.plc.map.final_ack;
    cell.regs.set_bit(final_ack.register, final_ack.bit, true);

    let stats = run.await.unwrap();
    assert_eq!(stats.completed, 1);

    let records = cell.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].result, RecordResult::Ng);
    assert_eq!(records[0].remark, IMAGE_NOT_FOUND);
    assert_eq!(records[0].scanner_data, "240615XX0007A");
    assert_eq!(records[0].grade, "A");
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_parts_get_consecutive_serials() {
    let (cell, mut orchestrator) = Cell::in_memory(2);
    for reading in ["0", "240615XX0007A", "0", "240615XX0008A"] {
        cell.scanner.push_reading(reading);
    }
    cell.place_image("240615XX0007");
    cell.place_image("240615XX0008");
    cell.start_plc(plc_behaviour(&cell.config));

    orchestrator.initialize().await.unwrap();
    let stats = orchestrator.run(cell.shutdown_signal()).await;

    assert_eq!(stats.cycle_count(), 2);
    let records = cell.store.records();
    let serials: Vec<&str> = records.iter().map(|r| r.serial_number.as_str()).collect();
    assert_eq!(serials, vec!["0007", "0008"]);
    assert!(records.iter().all(|r| r.result == RecordResult::Ok));
    assert_eq!(records[1].day_id, 2);
}
