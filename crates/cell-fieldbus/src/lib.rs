//! PLC register access for the marking cell.
//!
//! This crate provides:
//! - [`RegisterTransport`] trait for raw word read/write to the PLC
//! - [`modbus`] module with an async Modbus TCP client
//! - [`gateway`] module with the typed bit/word gateway used by the cycle
//! - [`SimulatedRegisters`] in-memory register map for testing and dry runs
//! - [`simulator`] module playing the PLC side of the handshake

pub mod gateway;
pub mod modbus;
pub mod simulator;

pub use gateway::*;
pub use modbus::{ModbusTcpClient, ModbusTcpConfig};
pub use simulator::{PlcBehaviour, PlcSimulator};

use async_trait::async_trait;
use cell_common::{CellError, CellResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raw register transport.
///
/// Implementations serialize requests internally, so a single transport
/// can be shared between the cycle and the monitor pollers.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    /// Open the connection. Calling it on an open transport is a no-op.
    async fn connect(&self) -> CellResult<()> {
        Ok(())
    }

    /// Read `count` consecutive holding registers starting at `register`.
    async fn read_registers(&self, register: u16, count: u16) -> CellResult<Vec<u16>>;

    /// Write one holding register.
    async fn write_register(&self, register: u16, value: u16) -> CellResult<()>;

    /// Release the connection.
    async fn shutdown(&self) -> CellResult<()> {
        Ok(())
    }

    /// Check if the transport currently holds a connection.
    fn is_operational(&self) -> bool {
        true
    }
}

/// In-memory register map.
///
/// Cloning shares the same registers, so a test can hold one handle
/// while the gateway owns another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRegisters {
    words: Arc<Mutex<HashMap<u16, u16>>>,
    writes: Arc<Mutex<Vec<(u16, u16)>>>,
    fail: Arc<AtomicBool>,
    stall_writes: Arc<AtomicBool>,
}

impl SimulatedRegisters {
    /// Create an all-zero register map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a register.
    #[must_use]
    pub fn word(&self, register: u16) -> u16 {
        self.words.lock().get(&register).copied().unwrap_or(0)
    }

    /// Overwrite a register (PLC side).
    pub fn set_word(&self, register: u16, value: u16) {
        self.words.lock().insert(register, value);
    }

    /// Current value of a flag.
    #[must_use]
    pub fn bit(&self, register: u16, bit: u8) -> bool {
        self.word(register) & (1 << bit) != 0
    }

    /// Set or clear a flag (PLC side).
    pub fn set_bit(&self, register: u16, bit: u8, value: bool) {
        let mut words = self.words.lock();
        let word = words.entry(register).or_insert(0);
        if value {
            *word |= 1 << bit;
        } else {
            *word &= !(1 << bit);
        }
    }

    /// Every write issued through the transport, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.writes.lock().clone()
    }

    /// Make every request fail with a transport error.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make writes hang forever (reads keep working).
    pub fn set_stall_writes(&self, stall: bool) {
        self.stall_writes.store(stall, Ordering::SeqCst);
    }

    fn check_failing(&self) -> CellResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(CellError::Transport("simulated transport failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RegisterTransport for SimulatedRegisters {
    async fn read_registers(&self, register: u16, count: u16) -> CellResult<Vec<u16>> {
        self.check_failing()?;
        let words = self.words.lock();
        Ok((0..count)
            .map(|i| words.get(&register.wrapping_add(i)).copied().unwrap_or(0))
            .collect())
    }

    async fn write_register(&self, register: u16, value: u16) -> CellResult<()> {
        self.check_failing()?;
        if self.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.words.lock().insert(register, value);
        self.writes.lock().push((register, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_registers() {
        let regs = SimulatedRegisters::new();
        regs.set_bit(1400, 0, true);
        assert_eq!(regs.read_registers(1400, 2).await.unwrap(), vec![1, 0]);

        regs.write_register(1401, 0xABCD).await.unwrap();
        assert_eq!(regs.word(1401), 0xABCD);
        assert_eq!(regs.writes(), vec![(1401, 0xABCD)]);
    }

    #[tokio::test]
    async fn test_simulated_failure() {
        let regs = SimulatedRegisters::new();
        regs.set_failing(true);
        assert!(matches!(
            regs.read_registers(0, 1).await,
            Err(CellError::Transport(_))
        ));
    }
}
