//! Cross-task setpoint cells and the communication-side device handle.
//!
//! The communication task never touches the controllers directly: it
//! drops setpoints into single-slot atomic cells that the control task
//! drains at the top of every 10 ms tick. Writes are last-wins and
//! observed atomically; command latency is therefore at most one tick.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chroma_common::state::DeviceState;
use parking_lot::RwLock;

use crate::pump::PumpCommand;

/// Single-slot latch for the latest pump setpoint.
#[derive(Debug, Default)]
pub struct PumpSetpointCell {
    bits: AtomicU64,
    dirty: AtomicBool,
}

impl PumpSetpointCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a setpoint; overwrites any unconsumed one.
    pub fn set(&self, cmd: PumpCommand) {
        let bits = ((cmd.flow_rate.to_bits() as u64) << 32) | cmd.acceleration.to_bits() as u64;
        self.bits.store(bits, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    /// Drain the cell; `None` when nothing new was written.
    pub fn take(&self) -> Option<PumpCommand> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return None;
        }
        let bits = self.bits.load(Ordering::Acquire);
        Some(PumpCommand {
            flow_rate: f32::from_bits((bits >> 32) as u32),
            acceleration: f32::from_bits(bits as u32),
        })
    }
}

/// Single-slot latch for the latest valve-pair request.
#[derive(Debug)]
pub struct ValveRequestCell {
    packed: AtomicU32,
}

const VALVE_REQ_NONE: u32 = u32::MAX;

impl ValveRequestCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            packed: AtomicU32::new(VALVE_REQ_NONE),
        })
    }

    /// Publish a reagent/column port pair.
    pub fn set(&self, reagent_port: u8, column_port: u8) {
        let packed = ((reagent_port as u32) << 8) | column_port as u32;
        self.packed.store(packed, Ordering::Release);
    }

    /// Drain the cell; `None` when nothing new was written.
    pub fn take(&self) -> Option<(u8, u8)> {
        let packed = self.packed.swap(VALVE_REQ_NONE, Ordering::AcqRel);
        if packed == VALVE_REQ_NONE {
            return None;
        }
        Some(((packed >> 8) as u8, packed as u8))
    }
}

/// Communication-side view of the device.
///
/// Ordering contract: `set_valves(a, b); set_pump(f)` makes the FSM
/// stop, move the valves, and only then apply `f`. The opposite order
/// briefly applies `f` against the old valve positions first.
#[derive(Clone)]
pub struct DeviceHandle {
    pump: Arc<PumpSetpointCell>,
    valves: Arc<ValveRequestCell>,
    state: Arc<RwLock<DeviceState>>,
}

impl DeviceHandle {
    pub fn new(
        pump: Arc<PumpSetpointCell>,
        valves: Arc<ValveRequestCell>,
        state: Arc<RwLock<DeviceState>>,
    ) -> Self {
        Self {
            pump,
            valves,
            state,
        }
    }

    /// Submit a pump setpoint; applied on the next control tick.
    pub fn set_pump(&self, cmd: PumpCommand) {
        self.pump.set(cmd);
    }

    /// Submit a valve-pair request; applied on the next control tick.
    pub fn set_valves(&self, reagent_port: u8, column_port: u8) {
        self.valves.set(reagent_port, column_port);
    }

    /// Copy of the latest published snapshot (at most one tick stale).
    pub fn state(&self) -> DeviceState {
        *self.state.read()
    }
}
