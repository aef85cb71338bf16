//! Cancellable waits.
//!
//! Every blocking step of the cycle resolves to whichever comes first of
//! its target condition, a reset signal, or its deadline. The result is a
//! tagged [`WaitOutcome`] that the orchestrator turns into control flow.

use cell_common::{CellError, CellResult, RegisterAddress};
use cell_fieldbus::RegisterGateway;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};

/// Default depth of the reset channel.
pub const RESET_CHANNEL_CAPACITY: usize = 8;

/// Emitted by the reset poller on a rising edge of the reset coil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSignal;

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T = ()> {
    /// The awaited condition or future completed.
    ConditionMet(T),
    /// A reset signal arrived first.
    Reset,
    /// The deadline expired first.
    Timeout,
}

impl<T> WaitOutcome<T> {
    /// Map interruptions to their control-flow errors.
    ///
    /// # Errors
    ///
    /// [`CellError::ResetDetected`] or [`CellError::StepTimeout`].
    pub fn into_result(self, step: impl Display, after: Duration) -> CellResult<T> {
        match self {
            Self::ConditionMet(value) => Ok(value),
            Self::Reset => Err(CellError::ResetDetected),
            Self::Timeout => Err(CellError::StepTimeout {
                step: step.to_string(),
                after,
            }),
        }
    }
}

/// Receiving end of the reset channel, owned by the orchestrator.
#[derive(Debug)]
pub struct ResetListener {
    rx: mpsc::Receiver<ResetSignal>,
    closed: bool,
}

impl ResetListener {
    /// Wrap a receiver.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<ResetSignal>) -> Self {
        Self { rx, closed: false }
    }

    /// Create a connected sender/listener pair.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<ResetSignal>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// Resolve on the next reset signal. Never resolves once every sender is gone.
    ///
    /// Cancel safe.
    pub async fn signalled(&mut self) {
        if !self.closed {
            if self.rx.recv().await.is_some() {
                return;
            }
            self.closed = true;
        }
        std::future::pending::<()>().await;
    }

    /// Discard queued signals, returning how many there were.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Whether a signal is queued; all queued signals are consumed.
    pub fn take_pending(&mut self) -> bool {
        self.drain() > 0
    }
}

/// Poll `address` until it reads `expected`. Transport errors are logged and retried.
pub async fn poll_bit(
    gateway: &RegisterGateway,
    address: RegisterAddress,
    expected: bool,
    interval: Duration,
) {
    loop {
        match gateway.read_bit(address).await {
            Ok(value) if value == expected => return,
            Ok(_) => trace!(%address, "Waiting for bit"),
            Err(e) => warn!(%address, error = %e, "Bit poll failed, retrying"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Race `future` against a reset signal and an optional deadline.
///
/// A reset wins ties.
pub async fn race<F: Future>(
    resets: &mut ResetListener,
    timeout: Option<Duration>,
    future: F,
) -> WaitOutcome<F::Output> {
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        () = resets.signalled() => WaitOutcome::Reset,
        output = future => WaitOutcome::ConditionMet(output),
        () = deadline => WaitOutcome::Timeout,
    }
}

/// Wait for a PLC flag to become true.
pub async fn wait_for_bit(
    gateway: &RegisterGateway,
    address: RegisterAddress,
    resets: &mut ResetListener,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> WaitOutcome {
    race(resets, timeout, poll_bit(gateway, address, true, poll_interval)).await
}

/// Sleep unless a reset arrives first. A full sleep reports `ConditionMet`.
pub async fn sleep_or_reset(resets: &mut ResetListener, duration: Duration) -> WaitOutcome {
    race(resets, None, tokio::time::sleep(duration)).await
}

/// Resolve once the shutdown flag is raised or its sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep unless shutdown is requested first. Returns false on shutdown.
pub async fn sleep_unless_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        biased;
        () = shutdown_requested(shutdown) => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_fieldbus::SimulatedRegisters;
    use std::sync::Arc;

    fn gateway(regs: &SimulatedRegisters) -> RegisterGateway {
        RegisterGateway::new(Arc::new(regs.clone()), Duration::from_secs(5))
    }

    const POLL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn test_condition_met() {
        let regs = SimulatedRegisters::new();
        let gw = gateway(&regs);
        let (_tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);

        let plc = regs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            plc.set_bit(1410, 3, true);
        });

        let outcome = wait_for_bit(
            &gw,
            RegisterAddress::new(1410, 3),
            &mut resets,
            POLL,
            Some(Duration::from_secs(100)),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::ConditionMet(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_preempts_wait() {
        let regs = SimulatedRegisters::new();
        let gw = gateway(&regs);
        let (tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(ResetSignal).await.unwrap();
        });

        let outcome = wait_for_bit(
            &gw,
            RegisterAddress::new(1410, 3),
            &mut resets,
            POLL,
            Some(Duration::from_secs(100)),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Reset);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let regs = SimulatedRegisters::new();
        let gw = gateway(&regs);
        let (_tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);

        let start = tokio::time::Instant::now();
        let outcome = wait_for_bit(
            &gw,
            RegisterAddress::new(1410, 3),
            &mut resets,
            POLL,
            Some(Duration::from_secs(100)),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Timeout);
        assert!(start.elapsed() >= Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_wins_over_ready_condition() {
        let regs = SimulatedRegisters::new();
        regs.set_bit(1400, 0, true);
        let gw = gateway(&regs);
        let (tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);
        tx.send(ResetSignal).await.unwrap();

        let outcome =
            wait_for_bit(&gw, RegisterAddress::new(1400, 0), &mut resets, POLL, None).await;
        assert_eq!(outcome, WaitOutcome::Reset);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_never_signals() {
        let (tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);
        drop(tx);
        let outcome = sleep_or_reset(&mut resets, Duration::from_secs(2)).await;
        assert_eq!(outcome, WaitOutcome::ConditionMet(()));
    }

    #[tokio::test]
    async fn test_drain_coalesces() {
        let (tx, mut resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);
        tx.send(ResetSignal).await.unwrap();
        tx.send(ResetSignal).await.unwrap();
        assert!(resets.take_pending());
        assert!(!resets.take_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_unless_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(sleep_unless_shutdown(&mut rx, Duration::from_secs(1)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
        });
        assert!(!sleep_unless_shutdown(&mut rx, Duration::from_secs(60)).await);
    }

    #[test]
    fn test_into_result() {
        let after = Duration::from_secs(100);
        assert_eq!(WaitOutcome::ConditionMet(7).into_result("X", after), Ok(7));
        assert_eq!(
            WaitOutcome::<()>::Reset.into_result("X", after),
            Err(CellError::ResetDetected)
        );
        assert_eq!(
            WaitOutcome::<()>::Timeout.into_result("AWAIT_TRANSFER_ACK", after),
            Err(CellError::StepTimeout {
                step: "AWAIT_TRANSFER_ACK".into(),
                after,
            })
        );
    }
}
