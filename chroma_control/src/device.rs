//! Device FSM: sequences pump-stop → valve-move → pump-resume.
//!
//! The fluid path must never change while the pump is moving. Any valve
//! request forces the FSM through `Stopping` (decelerate at the fixed
//! stop rate until the pump settles) and `SettingValves` (wait for both
//! valves); only then does `Pumping` re-apply the latched setpoint.

use std::sync::Arc;

use chroma_common::consts::STOP_DECELERATION;
use chroma_common::state::{DeviceState, FsmState};
use parking_lot::RwLock;

use crate::pump::{PumpCommand, PumpControl};
use crate::valve::ValveHandle;

/// The device-level coordinator, owned by the control task.
pub struct Device {
    pump: PumpControl,
    reagent_valve: ValveHandle,
    column_valve: ValveHandle,

    fsm: FsmState,
    pending_pump: PumpCommand,
    requested_reagent: u8,
    requested_column: u8,

    program_step_idx: u16,
    program_running: bool,
    program_progress: u8,

    published: Arc<RwLock<DeviceState>>,
}

impl Device {
    pub fn new(
        pump: PumpControl,
        reagent_valve: ValveHandle,
        column_valve: ValveHandle,
        published: Arc<RwLock<DeviceState>>,
    ) -> Self {
        Self {
            pump,
            reagent_valve,
            column_valve,
            fsm: FsmState::Pumping,
            pending_pump: PumpCommand::stop(),
            requested_reagent: 0,
            requested_column: 0,
            program_step_idx: 0,
            program_running: false,
            program_progress: 0,
            published,
        }
    }

    /// Latch a valve request and force the FSM into `Stopping`.
    pub fn set_valves(&mut self, reagent_port: u8, column_port: u8) {
        self.requested_reagent = reagent_port;
        self.requested_column = column_port;
        self.fsm = FsmState::Stopping;
    }

    /// Latch a pump setpoint; applied on the next `Pumping` tick.
    pub fn set_pump(&mut self, cmd: PumpCommand) {
        self.pending_pump = cmd;
    }

    /// Advance the pump speed ramp by one control tick.
    pub fn tick_speed(&mut self) {
        self.pump.tick_speed();
    }

    /// Run one FSM step and publish a fresh snapshot.
    pub fn tick(&mut self) {
        match self.fsm {
            FsmState::Initializing | FsmState::Pumping => {
                self.fsm = FsmState::Pumping;
                self.pump.set_setpoint(self.pending_pump);
            }
            FsmState::Stopping => {
                self.pump.set_setpoint(PumpCommand {
                    flow_rate: 0.0,
                    acceleration: STOP_DECELERATION,
                });
                if self.pump.is_stopped() {
                    self.reagent_valve.request_position(self.requested_reagent);
                    self.column_valve.request_position(self.requested_column);
                    self.fsm = FsmState::SettingValves;
                }
            }
            FsmState::SettingValves => {
                if self.reagent_valve.reached_target() && self.column_valve.reached_target() {
                    self.fsm = FsmState::Pumping;
                }
            }
        }
        self.publish();
    }

    /// Record program status; mirrored into the published snapshot so
    /// readers see the executor's view from the same tick.
    pub fn set_program_status(&mut self, step_idx: u16, running: bool, progress: u8) {
        self.program_step_idx = step_idx;
        self.program_running = running;
        self.program_progress = progress;
        let mut state = self.published.write();
        state.program_step_idx = step_idx;
        state.running = running as u8;
        state.program_step_progress = progress;
    }

    /// Volume delivered since the last reset [µL].
    pub fn volume_ul(&self) -> f32 {
        self.pump.volume_ul()
    }

    /// Restart the step volume accumulator.
    pub fn reset_volume(&mut self) {
        self.pump.reset_volume();
    }

    /// Current FSM state.
    pub fn fsm_state(&self) -> FsmState {
        self.fsm
    }

    /// Current pump speed [mL/min].
    pub fn pump_speed(&self) -> f32 {
        self.pump.current_speed()
    }

    fn publish(&self) {
        let snapshot = DeviceState {
            pump_speed: self.pump.current_speed(),
            pump_volume: self.pump.volume_ul(),
            program_step_idx: self.program_step_idx,
            device_state: self.fsm as u8,
            reagent_valve_position: self.reagent_valve.position(),
            reagent_valve_state: self.reagent_valve.state() as u8,
            column_valve_position: self.column_valve.position(),
            column_valve_state: self.column_valve.state() as u8,
            running: self.program_running as u8,
            program_step_progress: self.program_progress,
            padding: [0; 3],
        };
        *self.published.write() = snapshot;
    }
}
