//! Async Modbus TCP client.
//!
//! Covers the two functions the cell uses:
//! - Read Holding Registers (Function 0x03)
//! - Write Single Register (Function 0x06)
//!
//! Requests are serialized over one connection. Any I/O failure drops the
//! connection; the next request reconnects once the reconnect delay has passed.

use crate::RegisterTransport;
use async_trait::async_trait;
use cell_common::config::PlcConfig;
use cell_common::{CellError, CellResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Max Modbus TCP ADU size.
const MAX_FRAME: usize = 260;

/// Max registers per read request.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Modbus function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03).
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06).
    WriteSingleRegister = 0x06,
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Illegal function code.
    IllegalFunction = 0x01,
    /// Illegal data address.
    IllegalDataAddress = 0x02,
    /// Illegal data value.
    IllegalDataValue = 0x03,
    /// Server device failure.
    ServerDeviceFailure = 0x04,
    /// Acknowledge (request accepted, processing).
    Acknowledge = 0x05,
    /// Server device busy.
    ServerDeviceBusy = 0x06,
    /// Gateway path unavailable.
    GatewayPathUnavailable = 0x0A,
    /// Gateway target device failed to respond.
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Parse an exception code from a byte value.
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "Illegal Function"),
            Self::IllegalDataAddress => write!(f, "Illegal Data Address"),
            Self::IllegalDataValue => write!(f, "Illegal Data Value"),
            Self::ServerDeviceFailure => write!(f, "Server Device Failure"),
            Self::Acknowledge => write!(f, "Acknowledge"),
            Self::ServerDeviceBusy => write!(f, "Server Device Busy"),
            Self::GatewayPathUnavailable => write!(f, "Gateway Path Unavailable"),
            Self::GatewayTargetFailed => write!(f, "Gateway Target Failed"),
        }
    }
}

/// Modbus TCP Application Protocol (MBAP) header.
#[derive(Debug, Clone, Copy)]
struct MbapHeader {
    transaction_id: u16,
    protocol_id: u16,
    /// Length of unit ID + PDU.
    length: u16,
    unit_id: u8,
}

impl MbapHeader {
    const SIZE: usize = 7;

    fn new(transaction_id: u16, pdu_length: u16, unit_id: u8) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1,
            unit_id,
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> CellResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(transport(format!(
                "MBAP header too short: {} bytes",
                bytes.len()
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }
}

fn transport(msg: impl Into<String>) -> CellError {
    CellError::Transport(msg.into())
}

/// Configuration for the Modbus TCP client.
#[derive(Debug, Clone)]
pub struct ModbusTcpConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Unit ID (slave address), typically 1.
    pub unit_id: u8,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Response timeout per request.
    pub io_timeout: Duration,
    /// Minimum delay between reconnection attempts.
    pub reconnect_delay: Duration,
}

impl Default for ModbusTcpConfig {
    fn default() -> Self {
        Self::from(&PlcConfig::default())
    }
}

impl From<&PlcConfig> for ModbusTcpConfig {
    fn from(plc: &PlcConfig) -> Self {
        Self {
            server_addr: plc.address.clone(),
            unit_id: plc.unit_id,
            connect_timeout: plc.connect_timeout,
            io_timeout: plc.io_timeout,
            reconnect_delay: plc.reconnect_delay,
        }
    }
}

#[derive(Debug, Default)]
struct Connection {
    stream: Option<TcpStream>,
    transaction_id: u16,
    /// Next allowed reconnect time after a failed attempt.
    next_reconnect_time: Option<Instant>,
    reconnect_attempts: u32,
}

impl Connection {
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    fn drop_stream(&mut self) {
        self.stream = None;
    }
}

/// Modbus TCP client shared by every PLC user in the process.
#[derive(Debug)]
pub struct ModbusTcpClient {
    config: ModbusTcpConfig,
    conn: Mutex<Connection>,
    connected: AtomicBool,
}

impl ModbusTcpClient {
    /// Create a client; no connection is made until [`RegisterTransport::connect`]
    /// or the first request.
    #[must_use]
    pub fn new(config: ModbusTcpConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(Connection::default()),
            connected: AtomicBool::new(false),
        }
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ModbusTcpConfig {
        &self.config
    }

    async fn open(&self, conn: &mut Connection) -> CellResult<()> {
        info!(addr = %self.config.server_addr, "Connecting to Modbus TCP server");

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.server_addr),
        )
        .await
        .map_err(|_| transport(format!("Connection to {} timed out", self.config.server_addr)))?
        .map_err(|e| transport(format!("Connection failed: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| transport(format!("Failed to set TCP_NODELAY: {e}")))?;

        conn.stream = Some(stream);
        conn.reconnect_attempts = 0;
        conn.next_reconnect_time = None;
        self.connected.store(true, Ordering::SeqCst);

        info!("Connected to Modbus TCP server");
        Ok(())
    }

    /// Reconnect after a dropped connection, no more often than the reconnect delay.
    async fn ensure_connected(&self, conn: &mut Connection) -> CellResult<()> {
        if conn.stream.is_some() {
            return Ok(());
        }

        if let Some(next_time) = conn.next_reconnect_time {
            if Instant::now() < next_time {
                return Err(transport("Reconnecting: waiting for retry delay"));
            }
        }

        conn.reconnect_attempts += 1;
        warn!(
            attempt = conn.reconnect_attempts,
            "Attempting Modbus reconnection"
        );

        match self.open(conn).await {
            Ok(()) => Ok(()),
            Err(e) => {
                conn.next_reconnect_time = Some(Instant::now() + self.config.reconnect_delay);
                Err(e)
            }
        }
    }

    /// Send one request PDU and return the response PDU.
    async fn send_request(&self, pdu: &[u8]) -> CellResult<Vec<u8>> {
        let mut conn = self.conn.lock().await;
        self.ensure_connected(&mut conn).await?;

        let transaction_id = conn.next_transaction_id();
        let pdu_len = u16::try_from(pdu.len()).map_err(|_| transport("Request too large"))?;
        let header = MbapHeader::new(transaction_id, pdu_len, self.config.unit_id);

        let mut request = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
        request.extend_from_slice(&header.to_bytes());
        request.extend_from_slice(pdu);

        trace!(transaction_id, pdu_len = pdu.len(), "Sending Modbus request");

        let result = match conn.stream.as_mut() {
            Some(stream) => {
                tokio::time::timeout(self.config.io_timeout, exchange(stream, &request))
                    .await
                    .unwrap_or_else(|_| Err(transport("Modbus response timed out")))
            }
            None => Err(transport("Not connected to Modbus server")),
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                // The stream may hold a partial response; never reuse it.
                conn.drop_stream();
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        drop(conn);

        let (response_header, response_pdu) = frame;
        validate_header(&response_header, transaction_id, self.config.unit_id)?;
        check_exception(&response_pdu)?;

        trace!(transaction_id, pdu_len = response_pdu.len(), "Received Modbus response");
        Ok(response_pdu)
    }

    /// Read holding registers (function 0x03).
    ///
    /// # Errors
    ///
    /// Transport, exception, or framing errors.
    pub async fn read_holding_registers(&self, address: u16, quantity: u16) -> CellResult<Vec<u16>> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(transport(format!(
                "Invalid register count {quantity} (1-{MAX_READ_REGISTERS})"
            )));
        }
        let function = FunctionCode::ReadHoldingRegisters;
        let pdu = read_request(function, address, quantity);
        let response = self.send_request(&pdu).await?;
        parse_registers(&response, function, quantity)
    }

    /// Write a single register (function 0x06).
    ///
    /// # Errors
    ///
    /// Transport, exception, or echo mismatch errors.
    pub async fn write_single_register(&self, address: u16, value: u16) -> CellResult<()> {
        let [addr_hi, addr_lo] = address.to_be_bytes();
        let [val_hi, val_lo] = value.to_be_bytes();
        let pdu = [
            FunctionCode::WriteSingleRegister as u8,
            addr_hi,
            addr_lo,
            val_hi,
            val_lo,
        ];
        let response = self.send_request(&pdu).await?;
        check_echo(&response, FunctionCode::WriteSingleRegister, address, value)
    }
}

async fn exchange(stream: &mut TcpStream, request: &[u8]) -> CellResult<(MbapHeader, Vec<u8>)> {
    stream
        .write_all(request)
        .await
        .map_err(|e| transport(format!("Send failed: {e}")))?;

    let mut header_buf = [0u8; MbapHeader::SIZE];
    stream
        .read_exact(&mut header_buf)
        .await
        .map_err(|e| transport(format!("Receive header failed: {e}")))?;
    let header = MbapHeader::from_bytes(&header_buf)?;

    let pdu_length = usize::from(header.length.saturating_sub(1));
    if pdu_length == 0 || pdu_length > MAX_FRAME - MbapHeader::SIZE {
        return Err(transport(format!("Invalid response length: {pdu_length} bytes")));
    }

    let mut pdu = vec![0u8; pdu_length];
    stream
        .read_exact(&mut pdu)
        .await
        .map_err(|e| transport(format!("Receive PDU failed: {e}")))?;

    Ok((header, pdu))
}

fn validate_header(header: &MbapHeader, transaction_id: u16, unit_id: u8) -> CellResult<()> {
    if header.transaction_id != transaction_id {
        return Err(transport(format!(
            "Transaction ID mismatch: expected {}, got {}",
            transaction_id, header.transaction_id
        )));
    }
    if header.protocol_id != 0 {
        return Err(transport(format!(
            "Invalid protocol ID: {}",
            header.protocol_id
        )));
    }
    if header.unit_id != unit_id {
        return Err(transport(format!(
            "Unit ID mismatch: expected {}, got {}",
            unit_id, header.unit_id
        )));
    }
    Ok(())
}

/// Exception responses have the high bit of the function code set.
fn check_exception(pdu: &[u8]) -> CellResult<()> {
    if !pdu.is_empty() && (pdu[0] & 0x80) != 0 {
        let exception = pdu.get(1).map_or_else(
            || "Unknown".to_string(),
            |&code| {
                ExceptionCode::from_byte(code)
                    .map_or_else(|| format!("Unknown (0x{code:02X})"), |e| e.to_string())
            },
        );
        return Err(transport(format!("Modbus exception: {exception}")));
    }
    Ok(())
}

fn read_request(function: FunctionCode, address: u16, quantity: u16) -> [u8; 5] {
    let [addr_hi, addr_lo] = address.to_be_bytes();
    let [qty_hi, qty_lo] = quantity.to_be_bytes();
    [function as u8, addr_hi, addr_lo, qty_hi, qty_lo]
}

fn parse_registers(response: &[u8], function: FunctionCode, quantity: u16) -> CellResult<Vec<u16>> {
    if response.len() < 2 {
        return Err(transport("Response too short"));
    }

    if response[0] != function as u8 {
        return Err(transport(format!(
            "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
            function as u8, response[0]
        )));
    }

    let byte_count = usize::from(response[1]);
    let expected_bytes = usize::from(quantity) * 2;
    if byte_count != expected_bytes {
        return Err(transport(format!(
            "Expected {expected_bytes} bytes, got {byte_count}"
        )));
    }

    if response.len() < 2 + byte_count {
        return Err(transport(format!(
            "Response too short: expected {} bytes",
            2 + byte_count
        )));
    }

    Ok(response[2..2 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Write responses echo the function, address and value.
fn check_echo(response: &[u8], function: FunctionCode, address: u16, value: u16) -> CellResult<()> {
    if response.len() < 5 {
        return Err(transport("Response too short"));
    }

    if response[0] != function as u8 {
        return Err(transport(format!(
            "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
            function as u8, response[0]
        )));
    }

    let resp_address = u16::from_be_bytes([response[1], response[2]]);
    let resp_value = u16::from_be_bytes([response[3], response[4]]);

    if resp_address != address || resp_value != value {
        return Err(transport(format!(
            "Write echo mismatch: addr={resp_address}/{address}, value=0x{resp_value:04X}/0x{value:04X}"
        )));
    }

    Ok(())
}

#[async_trait]
impl RegisterTransport for ModbusTcpClient {
    async fn connect(&self) -> CellResult<()> {
        let mut conn = self.conn.lock().await;
        if conn.stream.is_some() {
            return Ok(());
        }
        self.open(&mut conn).await
    }

    async fn read_registers(&self, register: u16, count: u16) -> CellResult<Vec<u16>> {
        self.read_holding_registers(register, count).await
    }

    async fn write_register(&self, register: u16, value: u16) -> CellResult<()> {
        self.write_single_register(register, value).await
    }

    async fn shutdown(&self) -> CellResult<()> {
        let mut conn = self.conn.lock().await;
        if let Some(mut stream) = conn.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Modbus connection closed");
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_operational(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
