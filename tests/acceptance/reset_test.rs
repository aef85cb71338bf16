//! Reset handling acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A reset raised while the cell waits on the PLC aborts the iteration
//!   within one poll period of the reset coil
//! - A burst of reset edges gives back exactly one serial
//! - The pending record is closed as NG and the reset is acknowledged
//! - A pending manual serial reset survives a PLC reset

use super::common::{plc_behaviour, wait_for_event, Cell};
use cell_common::{CellEvent, RecordResult, NOT_AVAILABLE};
use cell_fieldbus::PlcBehaviour;
use cell_runtime::{CellCommand, ResetSignal};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_reset_burst_during_transfer_wait() {
    let (cell, mut orchestrator) = Cell::in_memory(1);
    cell.scanner.push_reading("0");
    cell.start_plc(PlcBehaviour {
        ack_transfer: false,
        ..plc_behaviour(&cell.config)
    });
    let monitor = cell.start_monitor();
    let mut events = cell.events.subscribe();
    let reset_coil = cell.config.plc.map.reset;
    let shutdown = cell.shutdown_signal();

    orchestrator.initialize().await.unwrap();
    let run = tokio::spawn(async move {
        let stats = orchestrator.run(shutdown).await;
        (orchestrator, stats)
    });

    wait_for_event(&mut events, "marking_data").await;
    assert_eq!(cell.store.records()[0].result, RecordResult::NotAvailable);

    // Two rising edges on the reset coil, both inside one reset handling.
    cell.regs.set_bit(reset_coil.register, reset_coil.bit, true);
    tokio::time::sleep(Duration::from_millis(120)).await;
    cell.regs.set_bit(reset_coil.register, reset_coil.bit, false);
    tokio::time::sleep(Duration::from_millis(120)).await;
    cell.regs.set_bit(reset_coil.register, reset_coil.bit, true);

    let (orchestrator, stats) = run.await.unwrap();
    assert_eq!(stats.aborted_reset, 1);
    assert_eq!(stats.cycle_count(), 0);

    // Serial 7 was issued and given back once.
    assert_eq!(orchestrator.serial().current(), 7);

    let records = cell.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].serial_number, "0007");
    assert_eq!(records[0].result, RecordResult::Ng);
    assert_eq!(records[0].scanner_data, NOT_AVAILABLE);

    assert!(cell.flag(cell.config.plc.map.reset_ack));
    // No verification read was attempted.
    assert_eq!(cell.scanner.calls(), vec![false]);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_while_idle() {
    let (cell, mut orchestrator) = Cell::in_memory(1);
    let monitor = cell.start_monitor();
    let reset_coil = cell.config.plc.map.reset;

    orchestrator.initialize().await.unwrap();
    let regs = cell.regs.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        regs.set_bit(reset_coil.register, reset_coil.bit, true);
    });
    let stats = orchestrator.run(cell.shutdown_signal()).await;

    assert_eq!(stats.aborted_reset, 1);
    assert!(cell.store.records().is_empty());
    // Every processed reset gives back one number, even with no part in the station.
    assert_eq!(orchestrator.serial().current(), 6);
    assert!(cell.flag(cell.config.plc.map.reset_ack));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_reset_survives_plc_reset() {
    let (cell, mut orchestrator) = Cell::in_memory(2);
    cell.scanner.push_reading("0");
    cell.scanner.push_reading("240615XX0042A");
    cell.place_image("240615XX0042");
    cell.start_plc(plc_behaviour(&cell.config));
    let mut events = cell.events.subscribe();

    cell.commands
        .send(CellCommand::ManualSerialReset { value: 42 })
        .await
        .unwrap();
    cell.resets.send(ResetSignal).await.unwrap();

    orchestrator.initialize().await.unwrap();
    let stats = orchestrator.run(cell.shutdown_signal()).await;

    assert_eq!(stats.aborted_reset, 1);
    assert_eq!(stats.completed, 1);

    let records = cell.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].serial_number, "0042");
    assert_eq!(records[0].marking_data, "240615XX0042");
    assert_eq!(records[0].result, RecordResult::Ok);

    let event = wait_for_event(&mut events, "resetComplete").await;
    assert_eq!(
        event,
        CellEvent::ResetComplete {
            success: true,
            reset_value: 42,
            current_value: 42,
            error: None,
        }
    );
}
