//! Configuration structures for the marking cell.
//!
//! Supports TOML deserialization with the defaults of the deployed cell,
//! so a config file only has to list what differs on site.

use crate::address::{MaskedBits, RegisterAddress, MAX_BIT};
use crate::settings::{FieldTemplate, GradePolicy, ShiftTable};
use crate::time::hhmm;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Highest serial number ever issued; reaching it wraps to the initial value.
pub const SERIAL_LIMIT: u32 = 9999;

/// Top-level cell configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    /// PLC connection and flag map.
    pub plc: PlcConfig,
    /// Alarm bits polled by the monitor.
    pub alarms: Vec<AlarmRule>,
    /// Barcode scanner connection.
    pub scanner: ScannerConfig,
    /// Serial number counter.
    pub serial: SerialConfig,
    /// Cycle timings and retry policy.
    pub cycle: CycleConfig,
    /// Reset and alarm poller timings.
    pub monitor: MonitorConfig,
    /// Hand-off files and image directories.
    pub files: FilesConfig,
    /// Results store.
    pub store: StoreConfig,
    /// Settings documents seeded into an empty store.
    pub settings: SettingsSeed,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            plc: PlcConfig::default(),
            alarms: AlarmRule::default_table(),
            scanner: ScannerConfig::default(),
            serial: SerialConfig::default(),
            cycle: CycleConfig::default(),
            monitor: MonitorConfig::default(),
            files: FilesConfig::default(),
            store: StoreConfig::default(),
            settings: SettingsSeed::default(),
        }
    }
}

impl CellConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.initial >= SERIAL_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "serial.initial must be below {SERIAL_LIMIT}, got {}",
                self.serial.initial
            )));
        }
        if self.scanner.max_reading_len == 0 {
            return Err(ConfigError::Invalid(
                "scanner.max_reading_len must be positive".into(),
            ));
        }
        if self.store.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store.connect_attempts must be at least 1".into(),
            ));
        }
        for rule in &self.alarms {
            if let Some(bad) = rule.bits.iter().find(|b| b.bit > MAX_BIT) {
                return Err(ConfigError::Invalid(format!(
                    "alarm {} on register {} uses bit {}",
                    bad.event, rule.register, bad.bit
                )));
            }
        }
        for mask in &self.plc.map.reset_masks {
            if mask.bits.iter().any(|&b| b > MAX_BIT) {
                return Err(ConfigError::Invalid(format!(
                    "reset mask for register {} has a bit above {MAX_BIT}",
                    mask.register
                )));
            }
        }
        Ok(())
    }
}

/// PLC (Modbus TCP) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    /// Server address (host:port).
    pub address: String,
    /// Unit ID (slave address).
    pub unit_id: u8,
    /// TCP connect timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-request response timeout.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Deadline for every PLC write.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Minimum delay between reconnection attempts.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Handshake flags.
    pub map: PlcMap,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            address: "192.168.3.146:502".to_string(),
            unit_id: 1,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            map: PlcMap::default(),
        }
    }
}

/// Handshake flags exchanged with the PLC program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcMap {
    /// Part in position, start the cycle.
    pub start: RegisterAddress,
    /// Reset coil watched by the monitor.
    pub reset: RegisterAddress,
    /// Set when a reset has been handled.
    pub reset_ack: RegisterAddress,
    /// Fires the scanner for the first read.
    pub first_scan_trigger: RegisterAddress,
    /// First read found no code; proceed to marking.
    pub first_scan_ng: RegisterAddress,
    /// First read found a code; part already marked.
    pub first_scan_ok: RegisterAddress,
    /// Hand-off files are ready for the marking controller.
    pub transfer_request: RegisterAddress,
    /// Marking controller took the files.
    pub transfer_ack: RegisterAddress,
    /// Fires the scanner for the verification read.
    pub second_scan_trigger: RegisterAddress,
    /// Verification passed.
    pub result_ok: RegisterAddress,
    /// Verification failed.
    pub result_ng: RegisterAddress,
    /// PLC finished handling the part.
    pub final_ack: RegisterAddress,
    /// Bits cleared by the masked reset.
    pub reset_masks: Vec<MaskedBits>,
}

impl Default for PlcMap {
    fn default() -> Self {
        Self {
            start: RegisterAddress::new(1400, 0),
            reset: RegisterAddress::new(1600, 0),
            reset_ack: RegisterAddress::new(1500, 3),
            first_scan_trigger: RegisterAddress::new(1415, 0),
            first_scan_ng: RegisterAddress::new(1414, 14),
            first_scan_ok: RegisterAddress::new(1414, 13),
            transfer_request: RegisterAddress::new(1414, 15),
            transfer_ack: RegisterAddress::new(1410, 3),
            second_scan_trigger: RegisterAddress::new(1416, 15),
            result_ok: RegisterAddress::new(1417, 0),
            result_ng: RegisterAddress::new(1417, 1),
            final_ack: RegisterAddress::new(1415, 7),
            reset_masks: vec![
                MaskedBits {
                    register: 1414,
                    bits: vec![3, 4, 6, 7],
                },
                MaskedBits {
                    register: 1415,
                    bits: vec![4],
                },
            ],
        }
    }
}

/// One alarm bit inside a monitored register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmBit {
    /// Bit index.
    pub bit: u8,
    /// Event name published while the bit is set.
    pub event: String,
    /// Operator message.
    pub message: String,
}

/// Alarm bits of one register; each register gets its own poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRule {
    /// Register number.
    pub register: u16,
    /// Monitored bits.
    pub bits: Vec<AlarmBit>,
}

impl AlarmRule {
    fn new(register: u16, bits: &[(u8, &str, &str)]) -> Self {
        Self {
            register,
            bits: bits
                .iter()
                .map(|(bit, event, message)| AlarmBit {
                    bit: *bit,
                    event: (*event).to_string(),
                    message: (*message).to_string(),
                })
                .collect(),
        }
    }

    /// Alarm table of the deployed cell.
    #[must_use]
    pub fn default_table() -> Vec<Self> {
        const REJECT_BIN: &str = "Put the part in the rejection bin";
        vec![
            Self::new(
                1490,
                &[
                    (0, "part-present", "Part not present"),
                    (1, "emergency-button", "Emergency push button pressed"),
                    (2, "safety-curtain", "Safety curtain error"),
                    (3, "servo-position", "Servo not home position"),
                    (4, "reject-bin", REJECT_BIN),
                ],
            ),
            Self::new(
                1600,
                &[(9, "ftp", "Image not getting saved , please run ftp server")],
            ),
            Self::new(1700, &[(1, "reject-bin", REJECT_BIN)]),
        ]
    }
}

/// Barcode scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Scanner address (host:port).
    pub address: String,
    /// TCP connect timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Optional per-line read timeout; reads block indefinitely when unset.
    #[serde(
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_timeout: Option<Duration>,
    /// CSV audit log of every reading.
    pub audit_log: Option<PathBuf>,
    /// Readings longer than this are truncated (the sentinel is exempt).
    pub max_reading_len: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            address: "192.168.3.147:5024".to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: None,
            audit_log: Some(PathBuf::from("scanner_data.csv")),
            max_reading_len: 29,
        }
    }
}

/// Serial number counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Value issued after a wraparound.
    pub initial: u32,
    /// Daily reset time (also resets the day id).
    #[serde(with = "hhmm")]
    pub reset_time: NaiveTime,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            initial: 1,
            reset_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

/// Cycle timings and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Bound on every PLC wait.
    #[serde(with = "humantime_serde")]
    pub step_timeout: Duration,
    /// PLC bit polling period inside waits.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Pause before each iteration.
    #[serde(with = "humantime_serde")]
    pub pre_cycle_delay: Duration,
    /// Extra verification reads after a failed one.
    pub second_scan_retries: u32,
    /// Delay between verification reads.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Time given to the camera to store its image.
    #[serde(with = "humantime_serde")]
    pub image_wait: Duration,
    /// Pause after the final acknowledgement.
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Pause after an unexpected cycle failure.
    #[serde(with = "humantime_serde")]
    pub error_cooldown: Duration,
    /// Pause after a masked reset.
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
    /// Gap between the writes of a masked reset.
    #[serde(with = "humantime_serde")]
    pub reset_write_gap: Duration,
    /// Rewrites of a hand-off file that fails read-back.
    pub write_retries: u32,
    /// Part number stamped on every record.
    pub part_number: String,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(100),
            poll_interval: Duration::from_millis(100),
            pre_cycle_delay: Duration::from_millis(1200),
            second_scan_retries: 2,
            retry_delay: Duration::from_secs(2),
            image_wait: Duration::from_secs(5),
            settle_time: Duration::from_secs(3),
            error_cooldown: Duration::from_secs(5),
            reset_settle: Duration::from_millis(500),
            reset_write_gap: Duration::from_millis(50),
            write_retries: 2,
            part_number: String::new(),
        }
    }
}

/// Reset and alarm poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Reset coil polling period.
    #[serde(with = "humantime_serde")]
    pub reset_poll_interval: Duration,
    /// Alarm polling period.
    #[serde(with = "humantime_serde")]
    pub alarm_poll_interval: Duration,
    /// Delay before restarting a poller that exited.
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reset_poll_interval: Duration::from_millis(50),
            alarm_poll_interval: Duration::from_millis(100),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Hand-off files and image directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Barcode text read by the marking controller.
    pub code_file: PathBuf,
    /// Date-prefixed serial read by the marking controller.
    pub text_file: PathBuf,
    /// Text between the date and the serial in `text_file`.
    pub serial_infix: String,
    /// Directory the camera writes images into.
    pub camera_dir: PathBuf,
    /// Directory images are archived to.
    pub backup_dir: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            code_file: PathBuf::from("data/code.txt"),
            text_file: PathBuf::from("data/text.txt"),
            serial_infix: "XX".to_string(),
            camera_dir: PathBuf::from("cameraimage"),
            backup_dir: PathBuf::from("img_backups"),
        }
    }
}

/// Results store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file.
    pub path: PathBuf,
    /// Open attempts at startup.
    pub connect_attempts: u32,
    /// Delay between open attempts.
    #[serde(with = "humantime_serde")]
    pub connect_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/records.redb"),
            connect_attempts: 5,
            connect_delay: Duration::from_secs(5),
        }
    }
}

/// Settings documents written to an empty store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSeed {
    /// Shift windows.
    pub shift_table: ShiftTable,
    /// Grade acceptance.
    pub grade: GradePolicy,
    /// Barcode template.
    pub field_template: FieldTemplate,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::error::CellError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{self, Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
