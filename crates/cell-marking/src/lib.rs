//! Serial numbers and barcode text for marked parts.
//!
//! - **Serial numbers** ([`serial`]): four-digit counter with wraparound,
//!   manual reset, and catch-up from persisted records
//! - **Day ids** ([`day_id`]): per-production-day record numbering
//! - **Barcodes** ([`barcode`]): template-driven barcode text
//!
//! # Example
//!
//! ```
//! use cell_common::{FieldTemplate, ShiftTable};
//! use cell_marking::{render_barcode, BarcodeContext, SerialCounter};
//! use chrono::{Local, NaiveTime, TimeZone};
//!
//! let shifts = ShiftTable::default();
//! let ctx = BarcodeContext {
//!     now: Local.with_ymd_and_hms(2024, 6, 15, 9, 30, 0).unwrap(),
//!     shifts: &shifts,
//!     part_number: "",
//! };
//! let mut counter = SerialCounter::new(7, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
//!
//! let barcode = render_barcode(&FieldTemplate::default(), &ctx, &mut counter, None);
//! assert_eq!(barcode.text, "240615XX0007");
//! ```

pub mod barcode;
pub mod day_id;
pub mod serial;

pub use barcode::{compose, render_barcode, serial_file_text, Barcode, BarcodeContext};
pub use day_id::DayIdCounter;
pub use serial::{format_serial, SerialCounter};
