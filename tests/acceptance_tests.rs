//! Acceptance tests for the laser-marking cell.
//!
//! These tests drive complete scan cycles against a simulated PLC and a
//! scripted scanner, with tokio time paused:
//! - Marking, verification, and record keeping of a good part
//! - Reset handling while the cell waits on the PLC
//! - Grade retries, already-marked parts, and missing camera images
//! - Counter recovery from the persistent results store

mod acceptance;
