//! Reset and alarm monitoring.
//!
//! Two kinds of pollers run beside the orchestrator for the whole process
//! lifetime:
//!
//! - The reset poller watches the reset coil and sends one [`ResetSignal`]
//!   per rising edge.
//! - One alarm poller per configured register publishes an alarm event for
//!   every set bit on every poll. Alarms are level-triggered and repeat while
//!   the condition holds.
//!
//! Every poller runs under a supervisor that restarts it after an error or a
//! panic. A poller returns `Ok(())` only on shutdown or when its consumer is
//! gone, which ends supervision.

use crate::wait::{shutdown_requested, sleep_unless_shutdown, ResetSignal};
use cell_common::config::{AlarmRule, CellConfig};
use cell_common::{CellEvent, CellResult, EventBus, RegisterAddress};
use cell_fieldbus::RegisterGateway;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Watches the reset coil.
///
/// The last observed level is shared between restarts, so a coil that is
/// still high after a transport hiccup does not signal twice.
#[derive(Debug, Clone)]
pub struct ResetPoller {
    gateway: RegisterGateway,
    address: RegisterAddress,
    interval: Duration,
    tx: mpsc::Sender<ResetSignal>,
    last_level: Arc<AtomicBool>,
}

impl ResetPoller {
    /// Create a poller for `address`.
    #[must_use]
    pub fn new(
        gateway: RegisterGateway,
        address: RegisterAddress,
        interval: Duration,
        tx: mpsc::Sender<ResetSignal>,
    ) -> Self {
        Self {
            gateway,
            address,
            interval,
            tx,
            last_level: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record a sample; true on a rising edge.
    fn rising_edge(&self, level: bool) -> bool {
        let previous = self.last_level.swap(level, Ordering::AcqRel);
        level && !previous
    }

    /// Poll until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the transport error of a failed read.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> CellResult<()> {
        debug!(address = %self.address, "Reset poller started");
        while sleep_unless_shutdown(&mut shutdown, self.interval).await {
            let level = self.gateway.read_bit(self.address).await?;
            if !self.rising_edge(level) {
                continue;
            }
            info!(address = %self.address, "Reset coil raised");
            match self.tx.try_send(ResetSignal) {
                // A full queue already holds an unprocessed reset.
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Reset listener gone, stopping reset poller");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Publishes the alarms of one register.
#[derive(Debug, Clone)]
pub struct AlarmPoller {
    gateway: RegisterGateway,
    rule: AlarmRule,
    interval: Duration,
    events: EventBus,
}

impl AlarmPoller {
    /// Create a poller for one alarm register.
    #[must_use]
    pub fn new(
        gateway: RegisterGateway,
        rule: AlarmRule,
        interval: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            gateway,
            rule,
            interval,
            events,
        }
    }

    /// Emit an alarm for every set bit of `word`. Returns how many fired.
    fn publish(&self, word: u16) -> usize {
        let mut fired = 0;
        for alarm in &self.rule.bits {
            let address = RegisterAddress::new(self.rule.register, alarm.bit);
            if word & address.mask() == 0 {
                continue;
            }
            fired += 1;
            self.events.emit(CellEvent::Alarm {
                name: alarm.event.clone(),
                address,
                message: alarm.message.clone(),
            });
        }
        fired
    }

    /// Poll until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the transport error of a failed read.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> CellResult<()> {
        debug!(register = self.rule.register, "Alarm poller started");
        while sleep_unless_shutdown(&mut shutdown, self.interval).await {
            let word = self.gateway.read_word(self.rule.register).await?;
            let fired = self.publish(word);
            if fired > 0 {
                debug!(register = self.rule.register, fired, "Alarms active");
            }
        }
        Ok(())
    }
}

/// Run the task produced by `start` until it returns `Ok(())` or shutdown is requested.
///
/// Errors and panics restart the task after `restart_delay`.
pub async fn supervise<F, Fut>(
    name: String,
    restart_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut start: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = CellResult<()>> + Send + 'static,
{
    let mut restarts = 0u32;
    loop {
        let mut task = tokio::spawn(start());
        let exit = tokio::select! {
            exit = &mut task => exit,
            () = shutdown_requested(&mut shutdown) => {
                task.abort();
                debug!(task = %name, "Supervised task cancelled");
                return;
            }
        };

        match exit {
            Ok(Ok(())) => {
                debug!(task = %name, restarts, "Supervised task finished");
                return;
            }
            Ok(Err(e)) => warn!(task = %name, error = %e, "Supervised task failed"),
            Err(e) if e.is_panic() => error!(task = %name, "Supervised task panicked"),
            Err(_) => return,
        }

        restarts += 1;
        if !sleep_unless_shutdown(&mut shutdown, restart_delay).await {
            return;
        }
        info!(task = %name, restarts, "Restarting supervised task");
    }
}

/// Handles of the running pollers.
#[derive(Debug)]
pub struct Monitor {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Start the reset poller and one alarm poller per configured register.
    #[must_use]
    pub fn spawn(
        gateway: &RegisterGateway,
        config: &CellConfig,
        resets: mpsc::Sender<ResetSignal>,
        events: &EventBus,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let restart_delay = config.monitor.restart_delay;
        let mut tasks = Vec::with_capacity(config.alarms.len() + 1);

        let reset = ResetPoller::new(
            gateway.clone(),
            config.plc.map.reset,
            config.monitor.reset_poll_interval,
            resets,
        );
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(supervise(
            "reset-poller".to_string(),
            restart_delay,
            shutdown_rx.clone(),
            move || {
                let poller = reset.clone();
                let rx = rx.clone();
                async move { poller.run(rx).await }
            },
        )));

        for rule in &config.alarms {
            let name = format!("alarm-poller-{}", rule.register);
            let poller = AlarmPoller::new(
                gateway.clone(),
                rule.clone(),
                config.monitor.alarm_poll_interval,
                events.clone(),
            );
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(supervise(
                name,
                restart_delay,
                shutdown_rx.clone(),
                move || {
                    let poller = poller.clone();
                    let rx = rx.clone();
                    async move { poller.run(rx).await }
                },
            )));
        }

        info!(pollers = tasks.len(), "Monitor started");
        Self { shutdown, tasks }
    }

    /// Number of supervised pollers.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Ask every poller to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
        info!("Monitor stopped");
    }

    /// Abort every poller without waiting.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{ResetListener, RESET_CHANNEL_CAPACITY};
    use cell_common::config::AlarmBit;
    use cell_fieldbus::SimulatedRegisters;
    use std::sync::atomic::AtomicUsize;

    fn gateway(regs: &SimulatedRegisters) -> RegisterGateway {
        RegisterGateway::new(Arc::new(regs.clone()), Duration::from_secs(5))
    }

    const INTERVAL: Duration = Duration::from_millis(50);

    #[tokio::test(start_paused = true)]
    async fn test_reset_signalled_once_per_edge() {
        let regs = SimulatedRegisters::new();
        let (tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);
        let (_stop, stop_rx) = watch::channel(false);
        let poller = ResetPoller::new(gateway(&regs), RegisterAddress::new(1600, 0), INTERVAL, tx);
        let task = tokio::spawn(async move { poller.run(stop_rx).await });

        regs.set_bit(1600, 0, true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(resets.drain(), 1);

        regs.set_bit(1600, 0, false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        regs.set_bit(1600, 0, true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(resets.drain(), 1);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_edge_survives_restart() {
        let regs = SimulatedRegisters::new();
        let (tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);
        let (stop, stop_rx) = watch::channel(false);
        let poller = ResetPoller::new(gateway(&regs), RegisterAddress::new(1600, 0), INTERVAL, tx);

        let p = poller.clone();
        let task = tokio::spawn(supervise(
            "reset".into(),
            Duration::from_millis(100),
            stop_rx.clone(),
            move || {
                let p = p.clone();
                let rx = stop_rx.clone();
                async move { p.run(rx).await }
            },
        ));

        regs.set_bit(1600, 0, true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        regs.set_failing(true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        regs.set_failing(false);
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The coil stayed high across the failure: still a single reset.
        assert_eq!(resets.drain(), 1);

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_repeats_while_set() {
        let regs = SimulatedRegisters::new();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let rule = AlarmRule {
            register: 1490,
            bits: vec![
                AlarmBit {
                    bit: 2,
                    event: "safety-curtain".into(),
                    message: "Safety curtain error".into(),
                },
                AlarmBit {
                    bit: 4,
                    event: "reject-bin".into(),
                    message: "Put the part in the rejection bin".into(),
                },
            ],
        };
        let (stop, stop_rx) = watch::channel(false);
        let poller = AlarmPoller::new(gateway(&regs), rule, Duration::from_millis(100), events);
        regs.set_bit(1490, 2, true);
        let task = tokio::spawn(async move { poller.run(stop_rx).await });

        tokio::time::sleep(Duration::from_millis(350)).await;
        stop.send(true).unwrap();
        task.await.unwrap().unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event.name().to_string());
        }
        assert_eq!(names, vec!["safety-curtain"; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_restarts_after_panic() {
        let (stop, stop_rx) = watch::channel(false);
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();

        supervise("flaky".into(), Duration::from_millis(10), stop_rx, move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match attempt {
                    0 => panic!("poller bug"),
                    1 => Err(cell_common::CellError::Transport("link down".into())),
                    _ => Ok(()),
                }
            }
        })
        .await;

        assert_eq!(starts.load(Ordering::SeqCst), 3);
        drop(stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_spawn_and_shutdown() {
        let regs = SimulatedRegisters::new();
        let config = CellConfig::default();
        let (tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);
        let events = EventBus::default();
        let mut rx = events.subscribe();

        let monitor = Monitor::spawn(&gateway(&regs), &config, tx, &events);
        assert_eq!(monitor.task_count(), 1 + config.alarms.len());

        regs.set_bit(1600, 0, true);
        regs.set_bit(1490, 0, true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        monitor.shutdown().await;

        assert!(resets.take_pending());
        let first = rx.try_recv().unwrap();
        assert_eq!(first.event.name(), "part-present");
    }
}
