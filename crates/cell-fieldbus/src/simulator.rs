//! PLC side of the cell handshake, played against [`SimulatedRegisters`].
//!
//! The simulator raises the start flag for each new part, acknowledges the
//! file transfer and the verification result, and clears its own flags
//! once the part leaves the station.

use crate::SimulatedRegisters;
use cell_common::config::PlcMap;
use cell_common::RegisterAddress;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// How the simulated PLC answers the cell.
#[derive(Debug, Clone)]
pub struct PlcBehaviour {
    /// Idle time before the next part arrives.
    pub part_interval: Duration,
    /// Whether the marking controller acknowledges transfer requests.
    pub ack_transfer: bool,
    /// Delay before the transfer acknowledgement.
    pub ack_delay: Duration,
    /// How long the final acknowledgement stays set; must outlast the
    /// cell's image wait.
    pub final_hold: Duration,
    /// Register polling period.
    pub poll_interval: Duration,
}

impl Default for PlcBehaviour {
    fn default() -> Self {
        Self {
            part_interval: Duration::from_secs(2),
            ack_transfer: true,
            ack_delay: Duration::from_millis(500),
            final_hold: Duration::from_secs(6),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Station {
    Empty { since: Instant },
    Loaded,
    Marking { requested: Instant },
    Finishing { since: Instant },
}

/// Scripted PLC reacting to the flags the cell writes.
#[derive(Debug, Clone)]
pub struct PlcSimulator {
    regs: SimulatedRegisters,
    map: PlcMap,
    behaviour: PlcBehaviour,
    parts: Arc<AtomicU64>,
}

impl PlcSimulator {
    /// Simulator over `regs` using the flag layout of `map`.
    #[must_use]
    pub fn new(regs: SimulatedRegisters, map: PlcMap, behaviour: PlcBehaviour) -> Self {
        Self {
            regs,
            map,
            behaviour,
            parts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Parts that have left the station so far, across every clone.
    #[must_use]
    pub fn parts_done(&self) -> u64 {
        self.parts.load(Ordering::Relaxed)
    }

    fn bit(&self, address: RegisterAddress) -> bool {
        self.regs.bit(address.register, address.bit)
    }

    fn set(&self, address: RegisterAddress, value: bool) {
        self.regs.set_bit(address.register, address.bit, value);
    }

    fn release_part(&self) {
        let map = &self.map;
        for address in [
            map.start,
            map.first_scan_trigger,
            map.first_scan_ng,
            map.first_scan_ok,
            map.transfer_request,
            map.transfer_ack,
            map.second_scan_trigger,
            map.result_ok,
            map.result_ng,
            map.final_ack,
        ] {
            self.set(address, false);
        }
        let parts = self.parts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(parts, "Part left the station");
    }

    fn step(&self, station: Station, now: Instant) -> Station {
        let map = &self.map;
        match station {
            Station::Empty { since } if now.duration_since(since) >= self.behaviour.part_interval => {
                self.set(map.start, true);
                debug!("Part arrived");
                Station::Loaded
            }
            Station::Loaded if self.bit(map.first_scan_ok) => {
                self.release_part();
                Station::Empty { since: now }
            }
            Station::Loaded if self.bit(map.transfer_request) => Station::Marking { requested: now },
            Station::Marking { requested }
                if self.behaviour.ack_transfer
                    && !self.bit(map.transfer_ack)
                    && now.duration_since(requested) >= self.behaviour.ack_delay =>
            {
                self.set(map.transfer_ack, true);
                station
            }
            Station::Marking { .. } if self.bit(map.result_ok) || self.bit(map.result_ng) => {
                self.set(map.final_ack, true);
                Station::Finishing { since: now }
            }
            Station::Finishing { since } if now.duration_since(since) >= self.behaviour.final_hold => {
                self.release_part();
                Station::Empty { since: now }
            }
            other => other,
        }
    }

    /// Answer the cell until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(behaviour = ?self.behaviour, "PLC simulator started");
        let mut station = Station::Empty {
            since: Instant::now(),
        };
        loop {
            station = self.step(station, Instant::now());
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.behaviour.poll_interval) => {}
            }
        }
        info!(parts = self.parts_done(), "PLC simulator stopped");
    }
}
