#![doc = "Common types and configuration shared by every crate of the laser-marking cell."]

pub mod address;
pub mod config;
pub mod error;
pub mod event;
pub mod record;
pub mod settings;
pub mod state;
pub mod time;

pub use address::*;
pub use error::*;
pub use event::*;
pub use record::*;
pub use settings::*;
pub use state::*;
pub use time::*;
