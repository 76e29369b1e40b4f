//! Device-state snapshot published by the control task.
//!
//! `DeviceState` is the single status word the rest of the system reads:
//! the command link ships it raw over the wire and the HTTP front-end
//! serializes it to JSON, so its 20-byte layout is frozen.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;

// ─── State Enums ────────────────────────────────────────────────────

/// Device FSM state.
///
/// While either valve is active the FSM sits in `Stopping` or
/// `SettingValves`, both of which command zero flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FsmState {
    /// Boot-time state, reported before the first control tick.
    Initializing = 0,
    /// Normal operation; the latched pump setpoint is applied every tick.
    Pumping = 1,
    /// Decelerating the pump ahead of a valve move.
    Stopping = 2,
    /// Waiting for both valves to reach their targets.
    SettingValves = 3,
}

impl FsmState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initializing),
            1 => Some(Self::Pumping),
            2 => Some(Self::Stopping),
            3 => Some(Self::SettingValves),
            _ => None,
        }
    }
}

impl Default for FsmState {
    fn default() -> Self {
        Self::Initializing
    }
}

/// Radial valve controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValveState {
    /// Initial idle state, driver disabled, not homed.
    Reset = 0,
    /// Driving toward the limit switch.
    Homing = 1,
    /// At target, driver disabled.
    Stopped = 2,
    /// Driving toward the target port, driver enabled.
    Moving = 3,
}

impl ValveState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Reset),
            1 => Some(Self::Homing),
            2 => Some(Self::Stopped),
            3 => Some(Self::Moving),
            _ => None,
        }
    }

    /// True when the valve is neither homing nor moving.
    #[inline]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Reset | Self::Stopped)
    }
}

impl Default for ValveState {
    fn default() -> Self {
        Self::Reset
    }
}

// ─── Snapshot ───────────────────────────────────────────────────────

/// Status snapshot overwritten in place every control tick.
///
/// Readers may see a value one tick stale but never torn: the publisher
/// replaces the struct as a whole. Field order mirrors the wire layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[repr(C)]
pub struct DeviceState {
    /// Current pump speed [mL/min].
    pub pump_speed: f32,
    /// Volume delivered since the start of the current step [µL].
    pub pump_volume: f32,
    /// Index of the executing program step.
    pub program_step_idx: u16,
    /// Raw [`FsmState`] discriminant.
    pub device_state: u8,
    /// Reagent valve logical position (0–5, 0xFF unknown).
    pub reagent_valve_position: u8,
    /// Raw reagent [`ValveState`] discriminant.
    pub reagent_valve_state: u8,
    /// Column valve logical position (0–5, 0xFF unknown).
    pub column_valve_position: u8,
    /// Raw column [`ValveState`] discriminant.
    pub column_valve_state: u8,
    /// 1 while a program is executing.
    pub running: u8,
    /// Current step completion, 0–255.
    pub program_step_progress: u8,
    /// Reserved.
    #[serde(skip)]
    pub padding: [u8; 3],
}

// The wire layout is frozen at 20 bytes.
assert_eq_size!(DeviceState, [u8; 20]);

impl DeviceState {
    /// Wire size [bytes].
    pub const BYTE_LEN: usize = 20;

    /// Typed view of `device_state`.
    pub fn fsm_state(&self) -> Option<FsmState> {
        FsmState::from_u8(self.device_state)
    }

    /// Serialize into the frozen little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut out = [0u8; Self::BYTE_LEN];
        out[0..4].copy_from_slice(&self.pump_speed.to_le_bytes());
        out[4..8].copy_from_slice(&self.pump_volume.to_le_bytes());
        out[8..10].copy_from_slice(&self.program_step_idx.to_le_bytes());
        out[10] = self.device_state;
        out[11] = self.reagent_valve_position;
        out[12] = self.reagent_valve_state;
        out[13] = self.column_valve_position;
        out[14] = self.column_valve_state;
        out[15] = self.running;
        out[16] = self.program_step_progress;
        out
    }

    /// Parse the wire layout. Returns `None` when the slice is short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::BYTE_LEN {
            return None;
        }
        Some(Self {
            pump_speed: f32::from_le_bytes(bytes[0..4].try_into().ok()?),
            pump_volume: f32::from_le_bytes(bytes[4..8].try_into().ok()?),
            program_step_idx: u16::from_le_bytes(bytes[8..10].try_into().ok()?),
            device_state: bytes[10],
            reagent_valve_position: bytes[11],
            reagent_valve_state: bytes[12],
            column_valve_position: bytes[13],
            column_valve_state: bytes[14],
            running: bytes[15],
            program_step_progress: bytes[16],
            padding: [0; 3],
        })
    }
}
