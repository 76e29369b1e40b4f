//! Program executor: drives the device FSM through an ordered step list.
//!
//! Runs entirely inside the control task. The communication task can
//! only set start/abort flags through [`ExecutorHandle`]; both take
//! effect on the next control tick, so the device is never mutated from
//! two tasks at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chroma_common::consts::{DEFAULT_PUMP_ACCELERATION, PORT_KEEP_CURRENT};
use chroma_common::program::{Program, ProgramStep};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::pump::PumpCommand;

/// Atomic mailboxes between the communication task and the executor.
#[derive(Debug, Default)]
struct ExecutorShared {
    start: AtomicBool,
    abort: AtomicBool,
    running: AtomicBool,
}

/// Communication-side control over the executor.
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    shared: Arc<ExecutorShared>,
}

impl ExecutorHandle {
    /// Request execution from step 0 on the next control tick.
    pub fn start(&self) {
        self.shared.start.store(true, Ordering::Release);
    }

    /// Request an abort on the next control tick; the pump then ramps
    /// down at the default acceleration.
    pub fn abort(&self) {
        self.shared.abort.store(true, Ordering::Release);
    }

    /// Published running flag.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

/// The program executor, owned by the control task.
pub struct ProgramExecutor {
    program: Arc<RwLock<Program>>,
    shared: Arc<ExecutorShared>,

    running: bool,
    step_idx: u16,
    current_step: ProgramStep,
    step_end_time_ms: u32,
    step_end_volume_ul: f32,
    progress: u8,
}

impl ProgramExecutor {
    pub fn new(program: Arc<RwLock<Program>>) -> (Self, ExecutorHandle) {
        let shared = Arc::new(ExecutorShared::default());
        let executor = Self {
            program,
            shared: shared.clone(),
            running: false,
            step_idx: 0,
            current_step: ProgramStep::default(),
            step_end_time_ms: 0,
            step_end_volume_ul: 0.0,
            progress: 0,
        };
        (executor, ExecutorHandle { shared })
    }

    /// True while a program is executing.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Index of the current (or last) step.
    pub fn step_idx(&self) -> u16 {
        self.step_idx
    }

    /// One control tick: consume mailboxes, check the current step for
    /// termination, advance, and publish the resulting status.
    pub fn tick(&mut self, now_ms: u32, device: &mut Device) {
        if self.shared.abort.swap(false, Ordering::AcqRel) {
            self.abort(device);
        }
        if self.shared.start.swap(false, Ordering::AcqRel) {
            self.start(now_ms, device);
        }

        if self.running && self.check_termination(now_ms, device.volume_ul()) {
            self.step_idx += 1;
            let next = self.program.read().read_at(self.step_idx);
            match next {
                Some(step) => {
                    self.current_step = step;
                    self.enter_step(now_ms, device);
                }
                None => self.finish(device),
            }
        }

        device.set_program_status(self.step_idx, self.running, self.progress);
    }

    /// Begin execution at step 0.
    fn start(&mut self, now_ms: u32, device: &mut Device) {
        self.step_idx = 0;
        let first = self.program.read().read_at(0);
        match first {
            Some(step) => {
                self.running = true;
                self.shared.running.store(true, Ordering::Release);
                self.current_step = step;
                self.enter_step(now_ms, device);
                info!("program started");
            }
            None => {
                warn!("execute requested with an empty program");
                self.running = false;
                self.shared.running.store(false, Ordering::Release);
                device.set_pump(PumpCommand::stop());
            }
        }
    }

    /// Stop execution; the pump ramps to zero at the default rate.
    fn abort(&mut self, device: &mut Device) {
        if self.running {
            info!(step = self.step_idx, "program aborted");
        }
        self.running = false;
        self.shared.running.store(false, Ordering::Release);
        device.set_pump(PumpCommand::stop());
    }

    fn finish(&mut self, device: &mut Device) {
        self.running = false;
        self.shared.running.store(false, Ordering::Release);
        device.set_pump(PumpCommand::stop());
        info!("program finished");
    }

    /// Apply one step to the device and latch its termination bounds.
    ///
    /// A step with either port set to "keep current" leaves the valves
    /// untouched, so a wait step never induces a Stopping transition.
    fn enter_step(&mut self, now_ms: u32, device: &mut Device) {
        device.reset_volume();
        let step = self.current_step;
        if step.reagent_port != PORT_KEEP_CURRENT && step.column_port != PORT_KEEP_CURRENT {
            device.set_valves(step.reagent_port, step.column_port);
        }
        device.set_pump(PumpCommand {
            flow_rate: step.flow_rate,
            acceleration: DEFAULT_PUMP_ACCELERATION,
        });

        self.step_end_time_ms = if step.duration.is_infinite() {
            u32::MAX
        } else {
            // Saturate both the float→int cast and the add; a NaN
            // duration casts to 0 and terminates on the next tick.
            now_ms.saturating_add((step.duration * 1000.0) as u32)
        };
        self.step_end_volume_ul = step.volume * 1000.0;
        self.progress = 0;
        debug!(
            step = self.step_idx,
            reagent = step.reagent_port,
            column = step.column_port,
            flow = step.flow_rate,
            "entered program step"
        );
    }

    /// Check the current step against its time and volume bounds and
    /// refresh the progress byte (the dominant bound drives it).
    fn check_termination(&mut self, now_ms: u32, volume_ul: f32) -> bool {
        if self.step_end_time_ms < now_ms {
            self.progress = 255;
            return true;
        }
        let time_progress = if self.current_step.duration.is_finite() {
            let total_ms = self.current_step.duration * 1000.0;
            let remaining_ms = (self.step_end_time_ms - now_ms) as f32;
            if total_ms > 0.0 {
                (255.0 * (1.0 - remaining_ms / total_ms)).clamp(0.0, 255.0) as u8
            } else {
                0
            }
        } else {
            0
        };

        if volume_ul >= self.step_end_volume_ul {
            self.progress = 255;
            return true;
        }
        let volume_progress = if self.step_end_volume_ul.is_finite() && self.step_end_volume_ul > 0.0
        {
            (255.0 * volume_ul / self.step_end_volume_ul).clamp(0.0, 255.0) as u8
        } else {
            0
        };

        self.progress = time_progress.max(volume_progress);
        false
    }
}
