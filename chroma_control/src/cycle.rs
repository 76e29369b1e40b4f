//! The 10 ms control cycle and the step-timer tasks.
//!
//! The control loop drains the cross-task cells, advances the pump ramp,
//! runs the device FSM and the program executor, and keeps O(1) timing
//! statistics. The three step-timer tasks emulate one-shot hardware
//! timers: each loops "emit one edge, sleep the returned delay".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chroma_common::consts::CONTROL_TICK_MS;
use chroma_hal::{Clock, InputPin, OutputPin, SystemClock};
use tracing::warn;

use crate::device::Device;
use crate::executor::ProgramExecutor;
use crate::handle::{PumpSetpointCell, ValveRequestCell};
use crate::pump::PumpStepper;
use crate::valve::RadialValve;

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-tick timing statistics; updated with no allocation.
#[derive(Debug, Clone)]
pub struct CycleStats {
    /// Total ticks executed.
    pub tick_count: u64,
    /// Last tick duration [µs].
    pub last_tick_us: u64,
    /// Minimum tick duration [µs].
    pub min_tick_us: u64,
    /// Maximum tick duration [µs].
    pub max_tick_us: u64,
    /// Running sum for average computation.
    pub sum_tick_us: u64,
    /// Ticks that ran past the period.
    pub overruns: u64,
}

impl CycleStats {
    pub const fn new() -> Self {
        Self {
            tick_count: 0,
            last_tick_us: 0,
            min_tick_us: u64::MAX,
            max_tick_us: 0,
            sum_tick_us: 0,
            overruns: 0,
        }
    }

    /// Record one tick duration.
    #[inline]
    pub fn record(&mut self, duration_us: u64) {
        self.tick_count += 1;
        self.last_tick_us = duration_us;
        if duration_us < self.min_tick_us {
            self.min_tick_us = duration_us;
        }
        if duration_us > self.max_tick_us {
            self.max_tick_us = duration_us;
        }
        self.sum_tick_us += duration_us;
    }

    /// Average tick duration [µs]; 0 before the first tick.
    #[inline]
    pub fn avg_tick_us(&self) -> u64 {
        if self.tick_count == 0 {
            0
        } else {
            self.sum_tick_us / self.tick_count
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Control Loop ───────────────────────────────────────────────────

/// The periodic control task body.
pub struct ControlLoop {
    device: Device,
    executor: ProgramExecutor,
    pump_cell: Arc<PumpSetpointCell>,
    valve_cell: Arc<ValveRequestCell>,
    clock: Box<dyn Clock>,
    period: Duration,
    stats: CycleStats,
}

impl ControlLoop {
    pub fn new(
        device: Device,
        executor: ProgramExecutor,
        pump_cell: Arc<PumpSetpointCell>,
        valve_cell: Arc<ValveRequestCell>,
    ) -> Self {
        Self {
            device,
            executor,
            pump_cell,
            valve_cell,
            clock: Box::new(SystemClock::new()),
            period: Duration::from_millis(CONTROL_TICK_MS),
            stats: CycleStats::new(),
        }
    }

    /// Replace the clock (tests use a simulated one).
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// One control tick: drain mailboxes, ramp, FSM, executor.
    pub fn tick(&mut self) {
        if let Some(cmd) = self.pump_cell.take() {
            self.device.set_pump(cmd);
        }
        if let Some((reagent, column)) = self.valve_cell.take() {
            self.device.set_valves(reagent, column);
        }

        self.device.tick_speed();
        self.device.tick();
        let now = self.clock.now_ms();
        self.executor.tick(now, &mut self.device);
    }

    /// Timing statistics so far.
    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Run until `shutdown` is set, pacing ticks at the control period.
    ///
    /// Overruns are counted and logged, never fatal: the tick body
    /// cannot fail, and a late tick only delays the next ramp update.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let mut next_tick = Instant::now() + self.period;
        while !shutdown.load(Ordering::Acquire) {
            let started = Instant::now();
            self.tick();
            let duration = started.elapsed();
            self.stats.record(duration.as_micros() as u64);

            if duration > self.period {
                self.stats.overruns += 1;
                warn!(
                    tick_us = duration.as_micros() as u64,
                    "control tick overran its period"
                );
                next_tick = Instant::now() + self.period;
            } else {
                if let Some(remaining) = next_tick.checked_duration_since(Instant::now()) {
                    std::thread::sleep(remaining);
                }
                next_tick += self.period;
            }
        }
    }
}

// ─── Task Spawning ──────────────────────────────────────────────────

/// Spawn the control task. Failure to create the thread is fatal at boot.
pub fn spawn_control_loop(
    mut control: ControlLoop,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("chroma-control".into())
        .spawn(move || control.run(&shutdown))
}

/// Spawn the pump step-timer task: emit an edge, sleep the returned delay.
pub fn spawn_pump_stepper<S, D, E>(
    mut stepper: PumpStepper<S, D, E>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>>
where
    S: OutputPin + 'static,
    D: OutputPin + 'static,
    E: OutputPin + 'static,
{
    std::thread::Builder::new()
        .name("chroma-pump-step".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                let delay_us = stepper.step();
                std::thread::sleep(Duration::from_micros(delay_us as u64));
            }
        })
}

/// Spawn one valve step-timer task.
pub fn spawn_valve<S, D, E, L>(
    mut valve: RadialValve<S, D, E, L>,
    name: &str,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>>
where
    S: OutputPin + 'static,
    D: OutputPin + 'static,
    E: OutputPin + 'static,
    L: InputPin + 'static,
{
    std::thread::Builder::new()
        .name(format!("chroma-{name}-step"))
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                let delay_us = valve.tick();
                std::thread::sleep(Duration::from_micros(delay_us as u64));
            }
        })
}
