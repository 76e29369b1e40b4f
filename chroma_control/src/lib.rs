//! # Chroma Control Core
//!
//! Real-time device-control subsystem of the chromatography controller:
//! the pump speed ramp, the radial valve state machines, the device FSM
//! that sequences pump-stop → valve-move → pump-resume, the program
//! executor, and the 10 ms control cycle that drives them.
//!
//! ## Two clocks
//!
//! Speed ramps and program progress advance on the 10 ms control tick;
//! step pulses fire from microsecond-scale timer tasks. The slow side
//! publishes a half-period through atomic cells that the fast side
//! consumes, so the hot path writes one pin and reschedules itself.
//!
//! ## Ownership
//!
//! The control task owns all mutable controller state. The communication
//! task only touches small atomic mailboxes ([`handle`]); the timer tasks
//! own their pins and read the published cells.

pub mod cycle;
pub mod device;
pub mod executor;
pub mod handle;
pub mod pump;
pub mod valve;

pub use cycle::{ControlLoop, CycleStats};
pub use device::Device;
pub use executor::{ExecutorHandle, ProgramExecutor};
pub use handle::DeviceHandle;
pub use pump::{PumpCommand, PumpControl, PumpShared, PumpStepper};
pub use valve::{RadialValve, ValveHandle, ValveShared};
