//! Radial selector valve control: homing and indexed positioning.
//!
//! The whole state machine runs in the valve's step-timer task, one
//! half-step per tick, so the control task never touches the pins.
//! Requests cross over through a single-slot atomic mailbox in
//! [`ValveShared`]; the published state and position flow back the same
//! way. [`ValveHandle::reached_target`] stays false while a request is
//! still parked in the mailbox, so the device FSM cannot observe a stale
//! "settled" state between requesting a move and the valve picking it up.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use chroma_common::config::ValveConfig;
use chroma_common::consts::{
    NUM_VALVE_PORTS, VALVE_MAX_STEP_DELAY_US, VALVE_MIN_STEP_DELAY_US, VALVE_POSITION_UNKNOWN,
    VALVE_SMOOTHNESS,
};
use chroma_common::state::ValveState;
use chroma_hal::{InputPin, OutputPin};
use tracing::warn;

/// Mailbox value: no request pending.
const REQ_NONE: u16 = 0xFFFF;
/// Mailbox value: re-home without changing the target port.
const REQ_HOME: u16 = 0x0100;

/// Atomic cells shared between the valve timer task and its handle.
#[derive(Debug)]
pub struct ValveShared {
    state: AtomicU8,
    position: AtomicU8,
    request: AtomicU16,
    homed: AtomicBool,
}

impl ValveShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(ValveState::Reset as u8),
            position: AtomicU8::new(VALVE_POSITION_UNKNOWN),
            request: AtomicU16::new(REQ_NONE),
            homed: AtomicBool::new(false),
        })
    }
}

/// Control-side view of one valve.
#[derive(Debug, Clone)]
pub struct ValveHandle {
    shared: Arc<ValveShared>,
}

impl ValveHandle {
    pub fn new(shared: Arc<ValveShared>) -> Self {
        Self { shared }
    }

    /// Request a move to a logical port. Out-of-range ports are ignored.
    pub fn request_position(&self, port: u8) {
        if port >= NUM_VALVE_PORTS {
            warn!(port, "ignoring out-of-range valve port request");
            return;
        }
        self.shared.request.store(port as u16, Ordering::Release);
    }

    /// Request a homing run against the limit switch.
    pub fn home(&self) {
        self.shared.request.store(REQ_HOME, Ordering::Release);
    }

    /// True when the valve is settled and no request is pending.
    pub fn reached_target(&self) -> bool {
        if self.shared.request.load(Ordering::Acquire) != REQ_NONE {
            return false;
        }
        self.state().is_settled()
    }

    /// Last requested logical port, or 0xFF before the first request.
    pub fn position(&self) -> u8 {
        self.shared.position.load(Ordering::Acquire)
    }

    /// Published controller state.
    pub fn state(&self) -> ValveState {
        ValveState::from_u8(self.shared.state.load(Ordering::Acquire))
            .unwrap_or(ValveState::Reset)
    }

    /// True once a homing run has completed.
    pub fn is_homed(&self) -> bool {
        self.shared.homed.load(Ordering::Acquire)
    }
}

/// Timer-side valve state machine; owns the pins.
#[derive(Debug)]
pub struct RadialValve<S, D, E, L> {
    shared: Arc<ValveShared>,
    step_pin: S,
    direction_pin: D,
    enable_pin: E,
    limit_switch: L,

    steps_per_revolution: u16,
    steps_per_port: u16,
    home_offset: u16,
    position_mapping: [u8; NUM_VALVE_PORTS as usize],

    state: ValveState,
    current_raw: u16,
    target_raw: u16,
    step_period_us: u32,
    step_state: bool,
    homed: bool,
    position: u8,
}

impl<S: OutputPin, D: OutputPin, E: OutputPin, L: InputPin> RadialValve<S, D, E, L> {
    /// Configure the pins and leave the valve idle in `Reset`.
    pub fn new(
        config: &ValveConfig,
        shared: Arc<ValveShared>,
        step_pin: S,
        mut direction_pin: D,
        mut enable_pin: E,
        limit_switch: L,
    ) -> Self {
        // Driver enable is active low; start disabled. Travel direction
        // is fixed: the valve always advances monotonically.
        enable_pin.set(true);
        direction_pin.set(config.invert_direction);
        let valve = Self {
            shared,
            step_pin,
            direction_pin,
            enable_pin,
            limit_switch,
            steps_per_revolution: config.steps_per_revolution,
            steps_per_port: config.steps_per_revolution / NUM_VALVE_PORTS as u16,
            home_offset: config.home_offset,
            position_mapping: config.position_mapping,
            state: ValveState::Reset,
            current_raw: 0,
            target_raw: 0,
            step_period_us: VALVE_MAX_STEP_DELAY_US,
            step_state: false,
            homed: false,
            position: VALVE_POSITION_UNKNOWN,
        };
        valve.publish();
        valve
    }

    /// Run one state-machine step; returns the delay until the next tick [µs].
    pub fn tick(&mut self) -> u32 {
        match self.shared.request.swap(REQ_NONE, Ordering::AcqRel) {
            REQ_NONE => {}
            REQ_HOME => self.begin_homing(),
            port => self.set_position(port as u8),
        }

        self.run_state_machine();
        self.publish();

        if self.state.is_settled() {
            VALVE_MAX_STEP_DELAY_US
        } else {
            self.step_period_us
        }
    }

    fn set_position(&mut self, port: u8) {
        self.position = port;
        if !self.homed {
            self.begin_homing();
        }
        // Start slow on every new target.
        self.step_period_us = VALVE_MAX_STEP_DELAY_US;
        let index = self.position_mapping[port as usize];
        self.target_raw = index as u16 * self.steps_per_port;
    }

    fn begin_homing(&mut self) {
        self.state = ValveState::Homing;
        self.enable_pin.set(false);
        self.step_period_us = VALVE_MAX_STEP_DELAY_US;
    }

    fn run_state_machine(&mut self) {
        match self.state {
            ValveState::Reset => {}

            ValveState::Homing => {
                if self.limit_switch.read() {
                    self.enable_pin.set(true);
                    self.state = ValveState::Stopped;
                    self.homed = true;
                    self.current_raw = self.home_offset;
                } else {
                    self.speed_up();
                    self.step();
                }
            }

            ValveState::Stopped => {
                if self.current_raw != self.target_raw {
                    self.enable_pin.set(false);
                    self.state = ValveState::Moving;
                }
            }

            ValveState::Moving => {
                if self.current_raw == self.target_raw {
                    self.state = ValveState::Stopped;
                    self.enable_pin.set(true);
                } else {
                    self.speed_up();
                    self.step();
                }
            }
        }
    }

    /// Emit one half-step; the raw counter advances once per full step
    /// and wraps at a full revolution.
    fn step(&mut self) {
        if !self.step_state {
            self.current_raw += 1;
            if self.current_raw == self.steps_per_revolution {
                self.current_raw = 0;
            }
        }
        self.step_state = !self.step_state;
        self.step_pin.set(self.step_state);
    }

    /// Geometric ramp: each tick shaves `period / smoothness`, flooring
    /// at the minimum period.
    fn speed_up(&mut self) {
        if self.step_period_us > VALVE_MIN_STEP_DELAY_US {
            self.step_period_us -= self.step_period_us / VALVE_SMOOTHNESS;
        }
        if self.step_period_us < VALVE_MIN_STEP_DELAY_US {
            self.step_period_us = VALVE_MIN_STEP_DELAY_US;
        }
    }

    fn publish(&self) {
        self.shared.state.store(self.state as u8, Ordering::Release);
        self.shared
            .position
            .store(self.position, Ordering::Release);
        self.shared.homed.store(self.homed, Ordering::Release);
    }

    /// Raw motor-step counter, for diagnostics.
    pub fn current_raw(&self) -> u16 {
        self.current_raw
    }
}
