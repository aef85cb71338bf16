//! Persistent TCP client for the line-scan reader.
//!
//! One socket is shared by every scan of a cycle. Callers queue on the
//! connection lock, so at most one read is in flight. Any socket error drops
//! the connection and the next call reconnects.

use crate::audit::AuditLog;
use crate::{is_no_read, normalize, ScannerError, ScannerPort};
use async_trait::async_trait;
use cell_common::config::ScannerConfig;
use cell_common::CellResult;
use chrono::Local;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long a no-read waits for its trailing sentinel line.
pub const NO_READ_GRACE: Duration = Duration::from_millis(100);

/// Raw lines of one acquisition plus the combined reading.
#[derive(Debug)]
struct Acquisition {
    first: String,
    second: String,
    reading: String,
}

/// Scanner client over a persistent TCP connection.
#[derive(Debug)]
pub struct ScannerClient {
    address: String,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    no_read_grace: Duration,
    audit: Option<AuditLog>,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

impl ScannerClient {
    /// Create a client; nothing is opened until the first call.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: None,
            no_read_grace: NO_READ_GRACE,
            audit: None,
            conn: Mutex::new(None),
        }
    }

    /// Build from the `[scanner]` section.
    #[must_use]
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            audit: config.audit_log.clone().map(AuditLog::new),
            ..Self::new(config.address.clone())
        }
    }

    /// Bound every line read; unset means block until the scanner answers.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Wait this long after a no-read for the second sentinel line.
    #[must_use]
    pub fn with_no_read_grace(mut self, grace: Duration) -> Self {
        self.no_read_grace = grace;
        self
    }

    /// Record every reading in `log`.
    #[must_use]
    pub fn with_audit_log(mut self, log: AuditLog) -> Self {
        self.audit = Some(log);
        self
    }

    /// Scanner address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn open(&self) -> Result<BufReader<TcpStream>, ScannerError> {
        info!(addr = %self.address, "Connecting to scanner");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| ScannerError::ConnectTimeout(self.address.clone()))??;
        stream.set_nodelay(true)?;
        info!(addr = %self.address, "Connected to scanner");
        Ok(BufReader::new(stream))
    }

    fn audit(&self, acquisition: &Acquisition) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.append(Local::now(), &acquisition.first, &acquisition.second) {
                warn!(error = %e, "Failed to append scanner audit row");
            }
        }
    }
}

async fn read_line(
    reader: &mut BufReader<TcpStream>,
    timeout: Option<Duration>,
) -> Result<String, ScannerError> {
    let mut line = String::new();
    let read = match timeout {
        Some(limit) => tokio::time::timeout(limit, reader.read_line(&mut line))
            .await
            .map_err(|_| ScannerError::ReadTimeout(limit))??,
        None => reader.read_line(&mut line).await?,
    };
    if read == 0 {
        return Err(ScannerError::Closed);
    }
    Ok(line.trim().to_string())
}

/// A no-read is sent as two `0` lines, not always in one segment. Wait up
/// to `grace` for the second one and swallow it so it is not taken as the
/// next reading. Any other line stays buffered.
async fn drain_trailing_no_read(reader: &mut BufReader<TcpStream>, grace: Duration) {
    if reader.buffer().is_empty() {
        match tokio::time::timeout(grace, reader.fill_buf()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Read after no-read failed");
                return;
            }
            Err(_) => return,
        }
    }
    let buffered = reader.buffer();
    let Some(end) = buffered.iter().position(|&b| b == b'\n') else {
        return;
    };
    let is_sentinel = std::str::from_utf8(&buffered[..end]).is_ok_and(is_no_read);
    if is_sentinel {
        reader.consume(end + 1);
    }
}

async fn acquire(
    reader: &mut BufReader<TcpStream>,
    timeout: Option<Duration>,
    no_read_grace: Duration,
    expect_second_line: bool,
) -> Result<Acquisition, ScannerError> {
    let first = read_line(reader, timeout).await?;
    let mut reading = normalize(&first);
    let mut second = String::new();

    if is_no_read(&first) {
        drain_trailing_no_read(reader, no_read_grace).await;
    } else if expect_second_line {
        second = read_line(reader, timeout).await?;
        reading.push_str(&second);
    }

    Ok(Acquisition {
        first,
        second,
        reading,
    })
}

#[async_trait]
impl ScannerPort for ScannerClient {
    async fn connect(&self) -> CellResult<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.open().await?);
        } else {
            debug!("Reusing scanner connection");
        }
        Ok(())
    }

    async fn get_reading(&self, expect_second_line: bool) -> CellResult<String> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.open().await?);
        }
        let Some(reader) = conn.as_mut() else {
            return Err(ScannerError::Closed.into());
        };

        match acquire(reader, self.read_timeout, self.no_read_grace, expect_second_line).await {
            Ok(acquisition) => {
                debug!(
                    first = %acquisition.first,
                    second = %acquisition.second,
                    reading = %acquisition.reading,
                    "Scanner reading"
                );
                self.audit(&acquisition);
                Ok(acquisition.reading)
            }
            Err(e) => {
                warn!(error = %e, "Scanner read failed, dropping connection");
                *conn = None;
                Err(e.into())
            }
        }
    }

    async fn invalidate(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!("Scanner connection invalidated");
        }
    }

    async fn close(&self) {
        if let Some(reader) = self.conn.lock().await.take() {
            let mut stream = reader.into_inner();
            let _ = stream.shutdown().await;
            info!("Scanner connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = ScannerConfig {
            read_timeout: Some(Duration::from_secs(3)),
            audit_log: None,
            ..ScannerConfig::default()
        };
        let client = ScannerClient::from_config(&config);
        assert_eq!(client.address(), "192.168.3.147:5024");
        assert_eq!(client.read_timeout, Some(Duration::from_secs(3)));
        assert!(client.audit.is_none());
    }

    #[tokio::test]
    async fn test_not_connected_initially() {
        let client = ScannerClient::new("127.0.0.1:1");
        assert!(!client.is_connected().await);
    }
}
