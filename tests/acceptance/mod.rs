//! Scan-cycle acceptance scenarios.

mod common;
mod cycle_test;
mod persistence_test;
mod reset_test;
