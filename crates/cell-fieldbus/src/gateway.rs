//! Typed bit/word access to PLC registers.
//!
//! Reads pass straight through to the transport. Writes are bounded by a
//! deadline: when it expires the PLC state is undefined and the caller
//! must not assume the write applied. The gateway never retries.

use crate::RegisterTransport;
use cell_common::{CellError, CellResult, MaskedBits, RegisterAddress};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Default deadline for PLC writes.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Register I/O gateway shared by the orchestrator and the monitor.
#[derive(Clone)]
pub struct RegisterGateway {
    transport: Arc<dyn RegisterTransport>,
    write_timeout: Duration,
}

impl std::fmt::Debug for RegisterGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterGateway")
            .field("write_timeout", &self.write_timeout)
            .field("operational", &self.transport.is_operational())
            .finish()
    }
}

impl RegisterGateway {
    /// Wrap a transport with the given write deadline.
    #[must_use]
    pub fn new(transport: Arc<dyn RegisterTransport>, write_timeout: Duration) -> Self {
        Self {
            transport,
            write_timeout,
        }
    }

    /// Write deadline in effect.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn RegisterTransport> {
        &self.transport
    }

    /// Read one flag.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; callers treat them as retryable.
    pub async fn read_bit(&self, address: RegisterAddress) -> CellResult<bool> {
        let word = self.read_word(address.register).await?;
        Ok(word & address.mask() != 0)
    }

    /// Read one register.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn read_word(&self, register: u16) -> CellResult<u16> {
        let words = self.read_words(register, 1).await?;
        words.first().copied().ok_or_else(|| {
            CellError::Transport(format!("empty response reading register {register}"))
        })
    }

    /// Read `count` consecutive registers.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn read_words(&self, register: u16, count: u16) -> CellResult<Vec<u16>> {
        let words = self.transport.read_registers(register, count).await?;
        trace!(register, count, ?words, "Read registers");
        Ok(words)
    }

    /// Set or clear one flag with a read-modify-write of its register.
    ///
    /// The deadline covers the whole exchange.
    ///
    /// # Errors
    ///
    /// [`CellError::WriteTimeout`] when the deadline expires, transport errors otherwise.
    pub async fn write_bit(
        &self,
        address: RegisterAddress,
        value: bool,
        timeout: Option<Duration>,
    ) -> CellResult<()> {
        let timeout = timeout.unwrap_or(self.write_timeout);
        let exchange = async {
            let word = self.read_word(address.register).await?;
            let updated = if value {
                word | address.mask()
            } else {
                word & !address.mask()
            };
            self.transport.write_register(address.register, updated).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| CellError::WriteTimeout { address, timeout })??;
        debug!(%address, value, "Wrote bit");
        Ok(())
    }

    /// Write one whole register.
    ///
    /// # Errors
    ///
    /// [`CellError::WriteTimeout`] when the deadline expires, transport errors otherwise.
    pub async fn write_word(
        &self,
        register: u16,
        value: u16,
        timeout: Option<Duration>,
    ) -> CellResult<()> {
        let timeout = timeout.unwrap_or(self.write_timeout);
        tokio::time::timeout(timeout, self.transport.write_register(register, value))
            .await
            .map_err(|_| CellError::WriteTimeout {
                address: RegisterAddress::new(register, 0),
                timeout,
            })??;
        debug!(register, value, "Wrote word");
        Ok(())
    }

    /// Clear `bits` in `register`: one read, `value & !mask`, one write.
    ///
    /// Not atomic against other writers of the same register.
    ///
    /// # Errors
    ///
    /// [`CellError::WriteTimeout`] when the deadline expires, transport errors otherwise.
    pub async fn reset_masked_bits(&self, mask: &MaskedBits) -> CellResult<u16> {
        let timeout = self.write_timeout;
        let register = mask.register;
        let exchange = async {
            let word = self.read_word(register).await?;
            let cleared = word & !mask.mask();
            self.transport.write_register(register, cleared).await?;
            Ok::<u16, CellError>(cleared)
        };
        let cleared = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| CellError::WriteTimeout {
                address: RegisterAddress::new(register, 0),
                timeout,
            })??;
        debug!(register, bits = ?mask.bits, value = cleared, "Masked reset");
        Ok(cleared)
    }
}
