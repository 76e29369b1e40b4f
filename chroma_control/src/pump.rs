//! Peristaltic pump control: trapezoidal speed ramp and step emission.
//!
//! The controller is split along the two clock domains. [`PumpControl`]
//! runs on the 10 ms control tick: it ramps the current speed toward the
//! setpoint and publishes the resulting half-step period. [`PumpStepper`]
//! runs in the step-timer task: it latches direction, toggles the step
//! pin and counts delivered volume. The two halves share a [`PumpShared`]
//! block of atomic cells and nothing else.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chroma_common::config::PumpConfig;
use chroma_common::consts::{
    DEFAULT_PUMP_ACCELERATION, MAX_FLOW_ML_MIN, PUMP_MAX_STEP_DELAY_US, PUMP_MIN_STEP_DELAY_US,
    PUMP_STOP_EPSILON,
};
use chroma_hal::OutputPin;

/// A pump setpoint: signed flow and ramp acceleration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpCommand {
    /// Commanded flow [mL/min]; the sign selects direction.
    pub flow_rate: f32,
    /// Ramp acceleration [mL/min per second], always positive.
    pub acceleration: f32,
}

impl PumpCommand {
    /// The stop command used by aborts and step boundaries.
    pub fn stop() -> Self {
        Self {
            flow_rate: 0.0,
            acceleration: DEFAULT_PUMP_ACCELERATION,
        }
    }

    /// Wire size of the command payload [bytes].
    pub const BYTE_LEN: usize = 8;

    /// Encode as two little-endian `f32`s (flow, acceleration).
    pub fn encode(&self) -> [u8; Self::BYTE_LEN] {
        let mut out = [0u8; Self::BYTE_LEN];
        out[0..4].copy_from_slice(&self.flow_rate.to_le_bytes());
        out[4..8].copy_from_slice(&self.acceleration.to_le_bytes());
        out
    }

    /// Decode from the wire layout. Returns `None` when the slice is short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::BYTE_LEN {
            return None;
        }
        Some(Self {
            flow_rate: f32::from_le_bytes(bytes[0..4].try_into().ok()?),
            acceleration: f32::from_le_bytes(bytes[4..8].try_into().ok()?),
        })
    }
}

impl Default for PumpCommand {
    fn default() -> Self {
        Self::stop()
    }
}

/// Atomic cells shared between the control tick and the step timer.
///
/// The timer side reads the half-period, the speed sign and the enable
/// flag, and increments the full-step counter. Everything else stays on
/// the control side.
#[derive(Debug)]
pub struct PumpShared {
    /// Half-step period published by the ramp [µs].
    half_period_us: AtomicU32,
    /// Bit pattern of the current speed (sign consumed by the stepper).
    speed_bits: AtomicU32,
    /// Driver enable requested by the ramp.
    enabled: AtomicBool,
    /// Full steps emitted since boot; wraps.
    full_steps: AtomicU32,
}

impl PumpShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            half_period_us: AtomicU32::new(PUMP_MAX_STEP_DELAY_US),
            speed_bits: AtomicU32::new(0.0f32.to_bits()),
            enabled: AtomicBool::new(false),
            full_steps: AtomicU32::new(0),
        })
    }

    /// Full steps emitted so far (wrapping counter).
    pub fn full_steps(&self) -> u32 {
        self.full_steps.load(Ordering::Acquire)
    }
}

// ─── Control-tick side ──────────────────────────────────────────────

/// Speed ramp and volume accounting, owned by the control task.
#[derive(Debug)]
pub struct PumpControl {
    shared: Arc<PumpShared>,
    target_speed: f32,
    current_speed: f32,
    acceleration: f32,
    /// Converts mL/min into µs per half-step: `30000 · volume_per_step`.
    step_time_coeff: f32,
    volume_per_step_ul: f32,
    dt: f32,
    /// Step count at the last volume reset.
    volume_base_steps: u32,
}

impl PumpControl {
    pub fn new(config: &PumpConfig, shared: Arc<PumpShared>) -> Self {
        Self {
            shared,
            target_speed: 0.0,
            current_speed: 0.0,
            acceleration: 0.0,
            step_time_coeff: 30_000.0 * config.volume_per_step_ul,
            volume_per_step_ul: config.volume_per_step_ul,
            dt: config.dt,
            volume_base_steps: 0,
        }
    }

    /// Latch a new setpoint. Pure; never blocks.
    ///
    /// Ingress sanitation: flow is clamped to ±[`MAX_FLOW_ML_MIN`] with
    /// `NaN` rejected to 0; a non-positive or non-finite acceleration
    /// falls back to the default so the ramp always makes progress.
    pub fn set_setpoint(&mut self, cmd: PumpCommand) {
        self.acceleration = if cmd.acceleration.is_finite() && cmd.acceleration > 0.0 {
            cmd.acceleration
        } else {
            DEFAULT_PUMP_ACCELERATION
        };
        self.target_speed = if cmd.flow_rate.is_nan() {
            0.0
        } else {
            cmd.flow_rate.clamp(-MAX_FLOW_ML_MIN, MAX_FLOW_ML_MIN)
        };
    }

    /// Advance the ramp by one control tick and republish the step timing.
    ///
    /// The speed moves toward the target by at most `acceleration · dt`
    /// and snaps to it inside one increment. Below the dead-zone the
    /// driver is disabled and the maximum delay is published so the step
    /// timer keeps ticking without emitting motion.
    pub fn tick_speed(&mut self) {
        let increment = self.acceleration * self.dt;
        if (self.target_speed - self.current_speed).abs() < increment {
            self.current_speed = self.target_speed;
        } else if self.target_speed > self.current_speed {
            self.current_speed += increment;
        } else if self.target_speed < self.current_speed {
            self.current_speed -= increment;
        }

        if self.current_speed.abs() < PUMP_STOP_EPSILON {
            self.shared
                .half_period_us
                .store(PUMP_MAX_STEP_DELAY_US, Ordering::Release);
            self.shared.enabled.store(false, Ordering::Release);
        } else {
            let delay = (self.step_time_coeff / self.current_speed.abs()) as u32;
            self.shared.half_period_us.store(
                delay.clamp(PUMP_MIN_STEP_DELAY_US, PUMP_MAX_STEP_DELAY_US),
                Ordering::Release,
            );
            self.shared.enabled.store(true, Ordering::Release);
        }
        self.shared
            .speed_bits
            .store(self.current_speed.to_bits(), Ordering::Release);
    }

    /// Current ramped speed [mL/min].
    pub fn current_speed(&self) -> f32 {
        self.current_speed
    }

    /// `true` once the ramp has settled at zero.
    pub fn is_stopped(&self) -> bool {
        self.current_speed.abs() < PUMP_STOP_EPSILON
    }

    /// Volume delivered since the last reset [µL].
    pub fn volume_ul(&self) -> f32 {
        let steps = self
            .shared
            .full_steps()
            .wrapping_sub(self.volume_base_steps);
        steps as f32 * self.volume_per_step_ul
    }

    /// Restart volume accounting at the current step count.
    pub fn reset_volume(&mut self) {
        self.volume_base_steps = self.shared.full_steps();
    }
}

// ─── Timer side ─────────────────────────────────────────────────────

/// Step-pulse emitter, owned by the pump step-timer task.
///
/// Each [`PumpStepper::step`] call emits one half-step edge and returns
/// the delay until the next one. Volume increments once per full step,
/// on the rising edge.
#[derive(Debug)]
pub struct PumpStepper<S, D, E> {
    shared: Arc<PumpShared>,
    step_pin: S,
    direction_pin: D,
    enable_pin: E,
    invert_direction: bool,
    step_state: bool,
    driver_enabled: bool,
}

impl<S: OutputPin, D: OutputPin, E: OutputPin> PumpStepper<S, D, E> {
    pub fn new(
        config: &PumpConfig,
        shared: Arc<PumpShared>,
        step_pin: S,
        direction_pin: D,
        mut enable_pin: E,
    ) -> Self {
        // Driver enable is active low; start disabled.
        enable_pin.set(true);
        Self {
            shared,
            step_pin,
            direction_pin,
            enable_pin,
            invert_direction: config.invert_direction,
            step_state: false,
            driver_enabled: false,
        }
    }

    /// Emit one half-step edge; returns the next delay [µs].
    ///
    /// When the ramp has the driver disabled, no edge is emitted and the
    /// maximum delay is returned so the timer keeps rearming itself.
    pub fn step(&mut self) -> u32 {
        let enabled = self.shared.enabled.load(Ordering::Acquire);
        if enabled != self.driver_enabled {
            self.enable_pin.set(!enabled);
            self.driver_enabled = enabled;
        }
        if !enabled {
            return PUMP_MAX_STEP_DELAY_US;
        }

        let speed = f32::from_bits(self.shared.speed_bits.load(Ordering::Acquire));
        if speed.abs() < PUMP_STOP_EPSILON {
            return PUMP_MAX_STEP_DELAY_US;
        }

        // Direction is latched from the speed sign before the edge.
        if speed > 0.0 {
            self.direction_pin.set(!self.invert_direction);
        } else {
            self.direction_pin.set(self.invert_direction);
        }

        self.step_state = !self.step_state;
        self.step_pin.set(self.step_state);
        if self.step_state {
            self.shared.full_steps.fetch_add(1, Ordering::AcqRel);
        }

        self.shared.half_period_us.load(Ordering::Acquire)
    }
}
