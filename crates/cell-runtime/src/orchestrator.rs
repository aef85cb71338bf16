//! The scan-cycle orchestrator.
//!
//! One iteration walks the cycle states in order:
//!
//! 1. `AWAIT_START`: wait for the part-in-position flag. Operator commands
//!    are applied while idle here.
//! 2. `FIRST_SCAN`: a readable code means the part is already marked and
//!    the iteration ends without marking.
//! 3. `GENERATE_BARCODE`: issue a serial, write the hand-off files, insert a
//!    pending record and request the transfer.
//! 4. `AWAIT_TRANSFER_ACK`: wait for the marking controller to take the files.
//! 5. `SECOND_SCAN`: verification reads with retries and the recorded
//!    outcome. After the image wait the camera image is archived and the
//!    result bit written. Without an image the record turns NG and the PLC
//!    gets no result bit.
//! 6. `FINALIZE`: wait for the PLC to release the part.
//!
//! Every wait races the reset channel and a deadline. A reset unwinds the
//! iteration through [`CellError::ResetDetected`], closes a pending record
//! as NG and runs the reset routine. A deadline does the same without the
//! reset acknowledgement or the serial compensation.

use crate::handoff::HandoffFiles;
use crate::images::{ImageArchive, ImageOutcome};
use crate::store::CellStore;
use crate::wait::{
    poll_bit, race, shutdown_requested, sleep_or_reset, sleep_unless_shutdown, wait_for_bit,
    ResetListener, WaitOutcome,
};
use cell_common::config::{CellConfig, CycleConfig, PlcMap};
use cell_common::{
    CellError, CellEvent, CellResult, Clock, CycleOutcome, CycleState, CycleStateMachine,
    EventBus, GradePolicy, MarkingRecord, RecordPatch, RecordResult, RegisterAddress,
    SystemClock, NG,
};
use cell_fieldbus::RegisterGateway;
use cell_marking::{
    render_barcode, serial_file_text, Barcode, BarcodeContext, DayIdCounter, SerialCounter,
};
use cell_scanner::ScannerPort;
use chrono::NaiveTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Message published when the first scan finds an already marked part.
pub const FIRST_SCAN_OK_MESSAGE: &str = "First scan detected OK part, cycle restarting";

/// Remark stored when no camera image matched the marking.
pub const IMAGE_NOT_FOUND: &str = "Image not found";

/// Grade recorded for a verification that never produced a code.
pub const NO_READ_GRADE: &str = "F";

/// Depth of the operator command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Operator commands, applied between cycles and while waiting for a part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellCommand {
    /// The next issued serial is exactly `value`.
    ManualSerialReset {
        /// Serial to issue next.
        value: u32,
    },
    /// Move the daily reset time of the serial and day-id counters.
    UpdateResetTime {
        /// Hour, 0..=23.
        hour: u32,
        /// Minute, 0..=59.
        minute: u32,
    },
    /// Change the serial issued after a wraparound.
    UpdateInitialSerial {
        /// New wraparound target.
        value: u32,
    },
}

/// Per-outcome cycle totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Cycles that marked and verified a part.
    pub completed: u64,
    /// Iterations cut short by a reset.
    pub aborted_reset: u64,
    /// Iterations that found an already marked part.
    pub aborted_ok_part: u64,
    /// Iterations whose PLC wait expired.
    pub aborted_timeout: u64,
    /// Iterations whose hand-off files failed verification.
    pub aborted_verification: u64,
    /// Iterations that ended in an unexpected error.
    pub failures: u64,
}

impl CycleStats {
    fn record(&mut self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Completed => self.completed += 1,
            CycleOutcome::AbortedReset => self.aborted_reset += 1,
            CycleOutcome::AbortedOkPart => self.aborted_ok_part += 1,
            CycleOutcome::AbortedTimeout => self.aborted_timeout += 1,
            CycleOutcome::AbortedVerification => self.aborted_verification += 1,
        }
    }

    /// The cycle counter: completed cycles.
    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.completed
    }

    /// Every iteration, whatever its outcome.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.completed
            + self.aborted_reset
            + self.aborted_ok_part
            + self.aborted_timeout
            + self.aborted_verification
            + self.failures
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    First,
    Second,
}

impl ScanKind {
    fn label(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Second => "second",
        }
    }
}

enum Idle {
    Start,
    Reset,
    Command(CellCommand),
}

/// Evaluated verification reading.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Verdict {
    scanner_data: String,
    grade: String,
    result: RecordResult,
}

/// Split a reading into its data and its uppercased trailing grade letter.
fn split_grade(reading: &str) -> (&str, String) {
    match reading.char_indices().last() {
        Some((index, grade)) => (&reading[..index], grade.to_uppercase().to_string()),
        None => ("", String::new()),
    }
}

/// Whether a verification reading ends the retry loop.
fn check_grade(reading: &str, policy: &GradePolicy) -> CellResult<()> {
    if reading == NG {
        return Err(CellError::GradeRejected {
            grade: NO_READ_GRADE.to_string(),
        });
    }
    let (_, grade) = split_grade(reading);
    if policy.accepts(&grade) {
        Ok(())
    } else {
        Err(CellError::GradeRejected { grade })
    }
}

fn evaluate(reading: &str, expected: &str, policy: &GradePolicy) -> Verdict {
    if reading == NG {
        return Verdict {
            scanner_data: NG.to_string(),
            grade: NO_READ_GRADE.to_string(),
            result: RecordResult::Ng,
        };
    }
    let (data, grade) = split_grade(reading);
    let result = if data == expected && policy.accepts(&grade) {
        RecordResult::Ok
    } else {
        RecordResult::Ng
    };
    Verdict {
        scanner_data: reading.to_string(),
        grade,
        result,
    }
}

fn truncate_reading(reading: String, max_len: usize) -> String {
    if reading == NG || reading.chars().count() <= max_len {
        reading
    } else {
        reading.chars().take(max_len).collect()
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: CellConfig,
    gateway: RegisterGateway,
    scanner: Arc<dyn ScannerPort>,
    store: Arc<dyn CellStore>,
    events: Option<EventBus>,
    clock: Option<Arc<dyn Clock>>,
    resets: Option<ResetListener>,
    commands: Option<mpsc::Receiver<CellCommand>>,
    iteration_limit: Option<u64>,
}

impl OrchestratorBuilder {
    /// Publish events on `events`.
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Read wall-clock time from `clock`.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Receive reset signals from `resets`.
    #[must_use]
    pub fn resets(mut self, resets: ResetListener) -> Self {
        self.resets = Some(resets);
        self
    }

    /// Receive operator commands from `commands`.
    #[must_use]
    pub fn commands(mut self, commands: mpsc::Receiver<CellCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Leave [`Orchestrator::run`] after `limit` iterations.
    #[must_use]
    pub fn iteration_limit(mut self, limit: u64) -> Self {
        self.iteration_limit = Some(limit);
        self
    }

    /// Assemble the orchestrator. Missing channels never deliver anything.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let now = clock.now();
        let resets = self
            .resets
            .unwrap_or_else(|| ResetListener::channel(1).1);
        let commands = self
            .commands
            .unwrap_or_else(|| mpsc::channel(1).1);
        let config = self.config;

        Orchestrator {
            handoff: HandoffFiles::from_config(&config.files, config.cycle.write_retries),
            images: ImageArchive::from_config(&config.files),
            serial: SerialCounter::from_config(&config.serial),
            day_ids: DayIdCounter::new(config.serial.reset_time, now),
            map: config.plc.map,
            cycle: config.cycle,
            max_reading_len: config.scanner.max_reading_len,
            serial_infix: config.files.serial_infix,
            gateway: self.gateway,
            scanner: self.scanner,
            store: self.store,
            events: self.events.unwrap_or_default(),
            clock,
            resets,
            commands,
            iteration_limit: self.iteration_limit,
            machine: CycleStateMachine::new(),
            stats: CycleStats::default(),
            sequence: 0,
            pending_row: None,
        }
    }
}

/// Drives the marking cell one part at a time.
pub struct Orchestrator {
    map: PlcMap,
    cycle: CycleConfig,
    max_reading_len: usize,
    serial_infix: String,
    gateway: RegisterGateway,
    scanner: Arc<dyn ScannerPort>,
    store: Arc<dyn CellStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    resets: ResetListener,
    commands: mpsc::Receiver<CellCommand>,
    iteration_limit: Option<u64>,
    serial: SerialCounter,
    day_ids: DayIdCounter,
    handoff: HandoffFiles,
    images: ImageArchive,
    machine: CycleStateMachine,
    stats: CycleStats,
    sequence: u64,
    /// Serial of a record inserted as N/A and not yet given its verdict.
    pending_row: Option<String>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.machine.state())
            .field("serial", &self.serial)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator from its collaborators.
    #[must_use]
    pub fn builder(
        config: CellConfig,
        gateway: RegisterGateway,
        scanner: Arc<dyn ScannerPort>,
        store: Arc<dyn CellStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            gateway,
            scanner,
            store,
            events: None,
            clock: None,
            resets: None,
            commands: None,
            iteration_limit: None,
        }
    }

    /// Current cycle state.
    #[must_use]
    pub fn state(&self) -> CycleState {
        self.machine.state()
    }

    /// Serial number counter.
    #[must_use]
    pub fn serial(&self) -> &SerialCounter {
        &self.serial
    }

    /// Day id counter.
    #[must_use]
    pub fn day_ids(&self) -> &DayIdCounter {
        &self.day_ids
    }

    /// Outcome totals so far.
    #[must_use]
    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Event bus the orchestrator publishes on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Resume the counters from the latest persisted record.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn initialize(&mut self) -> CellResult<()> {
        let now = self.clock.now();
        let latest = self.store.latest_record().await?;
        self.serial.restore(latest.as_ref(), now);
        self.day_ids.resume(latest.as_ref(), now);
        info!(
            next_serial = self.serial.current(),
            day_id = self.day_ids.last_issued(),
            "Orchestrator initialized"
        );
        Ok(())
    }

    /// Run iterations until shutdown is requested. An in-flight iteration is
    /// dropped at its current await point and its pending record closed as NG.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> CycleStats {
        info!("Scan loop started");
        loop {
            if self
                .iteration_limit
                .is_some_and(|limit| self.stats.iterations() >= limit)
            {
                info!(iterations = self.stats.iterations(), "Iteration limit reached");
                break;
            }
            self.apply_pending_commands();
            let pre_cycle_delay = self.cycle.pre_cycle_delay;
            let result = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => None,
                result = async {
                    tokio::time::sleep(pre_cycle_delay).await;
                    self.run_cycle().await
                } => Some(result),
            };

            match result {
                None => {
                    info!(state = %self.machine.state(), "Shutdown requested, leaving scan loop");
                    self.close_pending_row().await;
                    self.machine.restart();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, cooldown = ?self.cycle.error_cooldown, "Cycle failed");
                    if !sleep_unless_shutdown(&mut shutdown, self.cycle.error_cooldown).await {
                        break;
                    }
                }
            }
        }
        self.stats.clone()
    }

    /// Run one iteration to its outcome.
    ///
    /// # Errors
    ///
    /// Unexpected failures (transport, store, file system). Resets, expired
    /// waits and failed verification end the iteration with an outcome
    /// instead.
    pub async fn run_cycle(&mut self) -> CellResult<CycleOutcome> {
        self.sequence += 1;
        let cycle = self.sequence;
        let result = self.execute().await;
        let state = self.machine.state();

        let result = match result {
            Ok(outcome) => Ok(outcome),
            Err(e @ (CellError::ResetDetected | CellError::WriteTimeout { .. })) => {
                info!(cycle, %state, reason = %e, "Cycle interrupted by reset");
                self.close_pending_row().await;
                self.handle_reset().await;
                Ok(CycleOutcome::AbortedReset)
            }
            Err(e @ CellError::StepTimeout { .. }) => {
                warn!(cycle, %state, error = %e, "PLC wait expired");
                self.close_pending_row().await;
                self.clear_handshake().await;
                Ok(CycleOutcome::AbortedTimeout)
            }
            Err(e @ CellError::VerificationFailure { .. }) => {
                error!(cycle, error = %e, "Hand-off files not verified, marking skipped");
                Ok(CycleOutcome::AbortedVerification)
            }
            Err(e) => {
                self.close_pending_row().await;
                Err(e)
            }
        };

        self.machine.restart();
        match &result {
            Ok(outcome) => {
                self.stats.record(*outcome);
                info!(
                    cycle,
                    %outcome,
                    cycle_count = self.stats.cycle_count(),
                    "Iteration finished"
                );
            }
            Err(_) => self.stats.failures += 1,
        }
        result
    }

    async fn execute(&mut self) -> CellResult<CycleOutcome> {
        self.await_start().await?;

        self.enter(CycleState::FirstScan)?;
        let first = self.scan(ScanKind::First).await?;
        if first != NG {
            self.gateway.write_bit(self.map.first_scan_ok, true, None).await?;
            info!(cycle = self.sequence, reading = %first, "Part already marked");
            self.events.emit(CellEvent::FirstScanOk {
                scanner_data: first,
                message: FIRST_SCAN_OK_MESSAGE.to_string(),
            });
            return Ok(CycleOutcome::AbortedOkPart);
        }
        self.gateway.write_bit(self.map.first_scan_ng, true, None).await?;

        self.enter(CycleState::GenerateBarcode)?;
        let barcode = self.generate().await?;

        self.enter(CycleState::AwaitTransferAck)?;
        self.wait_for(self.map.transfer_ack).await?;

        self.enter(CycleState::SecondScan)?;
        self.verify_marking(&barcode).await?;

        self.enter(CycleState::Finalize)?;
        self.wait_for(self.map.final_ack).await?;
        self.pause(self.cycle.settle_time).await?;
        Ok(CycleOutcome::Completed)
    }

    fn enter(&mut self, state: CycleState) -> CellResult<()> {
        self.machine.transition(state)?;
        debug!(%state, "Entered state");
        Ok(())
    }

    /// Wait for the start flag, applying operator commands meanwhile.
    async fn await_start(&mut self) -> CellResult<()> {
        let start = self.map.start;
        let poll = self.cycle.poll_interval;
        loop {
            let idle = tokio::select! {
                biased;
                () = self.resets.signalled() => Idle::Reset,
                Some(command) = self.commands.recv() => Idle::Command(command),
                () = poll_bit(&self.gateway, start, true, poll) => Idle::Start,
            };
            match idle {
                Idle::Start => return Ok(()),
                Idle::Reset => return Err(CellError::ResetDetected),
                Idle::Command(command) => self.apply_command(command),
            }
        }
    }

    async fn wait_for(&mut self, address: RegisterAddress) -> CellResult<()> {
        let step = self.machine.state();
        let timeout = self.cycle.step_timeout;
        debug!(%step, %address, "Waiting for PLC");
        wait_for_bit(
            &self.gateway,
            address,
            &mut self.resets,
            self.cycle.poll_interval,
            Some(timeout),
        )
        .await
        .into_result(step, timeout)
    }

    async fn pause(&mut self, duration: Duration) -> CellResult<()> {
        sleep_or_reset(&mut self.resets, duration)
            .await
            .into_result(self.machine.state(), duration)
    }

    /// Trigger the scanner and read one code. The read races resets and the step deadline.
    async fn scan(&mut self, kind: ScanKind) -> CellResult<String> {
        let trigger = match kind {
            ScanKind::First => self.map.first_scan_trigger,
            ScanKind::Second => self.map.second_scan_trigger,
        };
        self.gateway.write_bit(trigger, true, None).await?;

        let step = self.machine.state();
        let timeout = self.cycle.step_timeout;
        let scanner = Arc::clone(&self.scanner);
        let outcome = race(
            &mut self.resets,
            Some(timeout),
            scanner.get_reading(kind == ScanKind::Second),
        )
        .await;
        if !matches!(outcome, WaitOutcome::ConditionMet(_)) {
            scanner.invalidate().await;
        }
        let reading = truncate_reading(outcome.into_result(step, timeout)??, self.max_reading_len);

        info!(scanner = kind.label(), %reading, "Scanner reading");
        self.events.emit(CellEvent::ScannerRead {
            scanner_type: kind.label().to_string(),
            data: reading.clone(),
        });
        Ok(reading)
    }

    async fn generate(&mut self) -> CellResult<Barcode> {
        let now = self.clock.now();
        let latest = self.store.latest_record().await?;
        let shifts = self.store.shift_table().await?;
        let template = self.store.field_template().await?;

        let barcode = render_barcode(
            &template,
            &BarcodeContext {
                now,
                shifts: &shifts,
                part_number: &self.cycle.part_number,
            },
            &mut self.serial,
            latest.as_ref(),
        );
        info!(cycle = self.sequence, barcode = %barcode.text, serial = %barcode.serial, "Barcode generated");

        let serial_text = serial_file_text(now, &self.serial_infix, &barcode.serial);
        self.handoff.write(&barcode.text, &serial_text).await?;

        let day_id = self.day_ids.next(now);
        let record = MarkingRecord::pending(
            now,
            &barcode.serial,
            &barcode.text,
            day_id,
            &self.cycle.part_number,
        );
        self.store.insert(&record).await?;
        self.pending_row = Some(barcode.serial.clone());
        self.events.emit(CellEvent::MarkingData {
            data: barcode.text.clone(),
        });

        self.gateway.write_bit(self.map.transfer_request, true, None).await?;
        Ok(barcode)
    }

    /// Verification reads, retried while the reading is a no-read or its grade is rejected.
    async fn second_scan(&mut self, policy: &GradePolicy) -> CellResult<String> {
        let retries = self.cycle.second_scan_retries;
        let mut attempt = 0;
        loop {
            let reading = match self.scan(ScanKind::Second).await {
                Ok(reading) => reading,
                Err(e @ (CellError::ResetDetected | CellError::WriteTimeout { .. })) => {
                    return Err(e)
                }
                Err(e) => {
                    warn!(error = %e, "Verification read failed, counting it as a no-read");
                    NG.to_string()
                }
            };

            match check_grade(&reading, policy) {
                Ok(()) => return Ok(reading),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    info!(attempt, retries, reason = %e, "Retrying verification read");
                    self.pause(self.cycle.retry_delay).await?;
                }
                Err(e) => {
                    warn!(reason = %e, "Verification retries exhausted, keeping last reading");
                    return Ok(reading);
                }
            }
        }
    }

    async fn verify_marking(&mut self, barcode: &Barcode) -> CellResult<()> {
        let policy = self.store.grade_policy().await?;
        let reading = self.second_scan(&policy).await?;

        let expected = match self.handoff.read_code().await {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "Code file unreadable, comparing with the issued barcode");
                barcode.text.clone()
            }
        };
        let verdict = evaluate(&reading, &expected, &policy);

        let patch = RecordPatch {
            scanner_data: Some(verdict.scanner_data.clone()),
            result: Some(verdict.result),
            grade: Some(verdict.grade.clone()),
            remark: Some(String::new()),
            ..RecordPatch::at(self.clock.now())
        };
        if !self.store.update_last_matching(&barcode.serial, &patch).await? {
            warn!(serial = %barcode.serial, "No pending record for verified marking");
        }
        self.pending_row = None;
        info!(
            serial = %barcode.serial,
            result = %verdict.result,
            grade = %verdict.grade,
            "Marking verified"
        );

        if !self.archive_image(barcode).await? {
            warn!(serial = %barcode.serial, "No verdict sent to the PLC without an image");
            return Ok(());
        }
        let result_bit = if verdict.result == RecordResult::Ok {
            self.map.result_ok
        } else {
            self.map.result_ng
        };
        self.gateway.write_bit(result_bit, true, None).await
    }

    /// Wait for the camera image and move it to the backup directory.
    ///
    /// A missing image turns the record NG and returns `false`.
    async fn archive_image(&mut self, barcode: &Barcode) -> CellResult<bool> {
        self.pause(self.cycle.image_wait).await?;
        match self.images.archive(&barcode.text).await {
            Ok(ImageOutcome::Archived(path)) => info!(path = %path.display(), "Image archived"),
            Ok(ImageOutcome::Vanished(path)) => {
                warn!(path = %path.display(), "Image vanished before it could be archived");
            }
            Err(e @ CellError::ImageNotFound { .. }) => {
                warn!(error = %e, "Image not found");
                self.events.emit(CellEvent::ImageSaveError {
                    message: format!("Failed to save image for marking data: {}", barcode.text),
                    path: self.images.camera_dir().display().to_string(),
                });
                let patch = RecordPatch {
                    result: Some(RecordResult::Ng),
                    remark: Some(IMAGE_NOT_FOUND.to_string()),
                    ..RecordPatch::at(self.clock.now())
                };
                self.store.update_last_matching(&barcode.serial, &patch).await?;
                return Ok(false);
            }
            Err(e) => warn!(error = %e, "Image archive failed"),
        }
        Ok(true)
    }

    /// Close a record left pending by an interrupted iteration.
    async fn close_pending_row(&mut self) {
        let Some(serial) = self.pending_row.take() else {
            return;
        };
        let serial = serial.as_str();
        match self
            .store
            .update_last_matching(serial, &RecordPatch::aborted(self.clock.now()))
            .await
        {
            Ok(true) => info!(serial, "Pending record closed as NG"),
            Ok(false) => warn!(serial, "Pending record not found"),
            Err(e) => error!(serial, error = %e, "Failed to close pending record"),
        }
    }

    /// Acknowledge a reset, clear the handshake bits and give back one serial.
    ///
    /// Signals queued meanwhile belong to the same reset.
    async fn handle_reset(&mut self) {
        let mut coalesced = self.resets.drain();
        if let Err(e) = self.gateway.write_bit(self.map.reset_ack, true, None).await {
            warn!(error = %e, "Reset acknowledgement failed");
        }
        self.clear_handshake().await;
        tokio::time::sleep(self.cycle.reset_settle).await;
        coalesced += self.resets.drain();

        if self.serial.compensate() {
            info!(next_serial = self.serial.current(), coalesced, "Reset handled, serial given back");
        } else {
            info!(coalesced, "Reset handled, manual serial reset pending");
        }
    }

    /// Clear the handshake bits listed in the reset masks.
    pub async fn clear_handshake(&self) {
        for mask in &self.map.reset_masks {
            tokio::time::sleep(self.cycle.reset_write_gap).await;
            if let Err(e) = self.gateway.reset_masked_bits(mask).await {
                warn!(register = mask.register, error = %e, "Masked reset failed");
            }
        }
    }

    fn apply_pending_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply_command(command);
        }
    }

    fn apply_command(&mut self, command: CellCommand) {
        let now = self.clock.now();
        match command {
            CellCommand::ManualSerialReset { value } => {
                let error = self.serial.manual_reset(value, now).err();
                if let Some(e) = &error {
                    warn!(value, error = %e, "Manual serial reset rejected");
                }
                self.events.emit(CellEvent::ResetComplete {
                    success: error.is_none(),
                    reset_value: value,
                    current_value: self.serial.current(),
                    error: error.map(|e| e.to_string()),
                });
            }
            CellCommand::UpdateResetTime { hour, minute } => {
                let event = match NaiveTime::from_hms_opt(hour, minute, 0) {
                    Some(time) => {
                        self.serial.set_reset_time(time);
                        self.day_ids.set_reset_time(time, now);
                        CellEvent::ResetTimeComplete {
                            success: true,
                            hour,
                            minute,
                            message: format!("Reset time updated to {hour:02}:{minute:02}"),
                        }
                    }
                    None => {
                        warn!(hour, minute, "Invalid reset time");
                        CellEvent::ResetTimeComplete {
                            success: false,
                            hour,
                            minute,
                            message: format!("Invalid reset time {hour}:{minute}"),
                        }
                    }
                };
                self.events.emit(event);
            }
            CellCommand::UpdateInitialSerial { value } => {
                if let Err(e) = self.serial.set_initial(value) {
                    warn!(value, error = %e, "Initial serial rejected");
                }
            }
        }
    }
}
