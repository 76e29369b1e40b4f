//! System-wide constants for the chroma workspace.
//!
//! Single source of truth for all numeric limits and default paths.
//! Imported by all crates; no duplication permitted.

// ─── Pump ───────────────────────────────────────────────────────────

/// Maximum commanded flow magnitude [mL/min]. Setpoints are clamped here.
pub const MAX_FLOW_ML_MIN: f32 = 10.0;

/// Longest pump half-step delay [µs]. Returned when no motion is due so
/// the step timer keeps rearming itself.
pub const PUMP_MAX_STEP_DELAY_US: u32 = 100_000;

/// Shortest pump half-step delay [µs]. Sits below the shortest period
/// any in-range flow can produce (≈225 µs at 10 mL/min), so the clamp
/// only guards against a miscalibrated volume-per-step.
pub const PUMP_MIN_STEP_DELAY_US: u32 = 200;

/// Speed magnitude below which the pump counts as stopped [mL/min].
pub const PUMP_STOP_EPSILON: f32 = 1e-6;

/// Delivered volume per full motor step [µL] (calibration default).
pub const DEFAULT_VOLUME_PER_STEP_UL: f32 = 0.0752192;

/// Acceleration applied when a program step or an abort commands the pump [mL/min/s].
pub const DEFAULT_PUMP_ACCELERATION: f32 = 5.0;

/// Deceleration used while the device FSM stops the pump for a valve move [mL/min/s].
pub const STOP_DECELERATION: f32 = 10.0;

// ─── Valves ─────────────────────────────────────────────────────────

/// Number of physical ports on each radial valve.
pub const NUM_VALVE_PORTS: u8 = 6;

/// Shortest valve half-step delay [µs].
pub const VALVE_MIN_STEP_DELAY_US: u32 = 500;

/// Longest valve half-step delay [µs]. Motion always starts here.
pub const VALVE_MAX_STEP_DELAY_US: u32 = 30_000;

/// Geometric decay divisor for the valve acceleration ramp.
pub const VALVE_SMOOTHNESS: u32 = 100;

/// Valve position byte meaning "not yet homed / unknown".
pub const VALVE_POSITION_UNKNOWN: u8 = 0xFF;

// ─── Control loop ───────────────────────────────────────────────────

/// Control task period [ms]. Speed ramps and program progress advance here.
pub const CONTROL_TICK_MS: u64 = 10;

// ─── Program ────────────────────────────────────────────────────────

/// Memory budget for program storage [bytes].
pub const PROGRAM_MAX_MEMORY: usize = 65_536;

/// Frozen wire size of one program step [bytes].
pub const PROGRAM_STEP_SIZE: usize = 16;

/// Maximum number of steps a program can hold.
pub const PROGRAM_MAX_STEPS: u16 = (PROGRAM_MAX_MEMORY / PROGRAM_STEP_SIZE) as u16;

/// Port byte meaning "keep the current valve position".
pub const PORT_KEEP_CURRENT: u8 = 0xFF;

/// Number of named reagent inlets.
pub const NUM_REAGENTS: usize = 6;

/// Number of named outlet columns.
pub const NUM_COLUMNS: usize = 6;

/// Fixed width of one reagent/column name [bytes].
pub const NAME_LEN: usize = 40;

// ─── Command link ───────────────────────────────────────────────────

/// Frame start sequence.
pub const FRAME_START: [u8; 2] = [0x21, 0x37];

/// Size of the CRC32 trailer [bytes].
pub const FRAME_CRC_LEN: usize = 4;

/// Largest payload one frame can carry: LEN is a single byte that also
/// counts the CRC trailer.
pub const FRAME_MAX_PAYLOAD: usize = 255 - FRAME_CRC_LEN;

/// Serial line rate [bps].
pub const LINK_BAUD_RATE: u32 = 115_200;

/// Receive timeout while waiting for a frame to begin [ms].
pub const LINK_RECEIVE_TIMEOUT_MS: u64 = 10;

/// Most program steps a single write/read block command can carry.
pub const LINK_MAX_BLOCK_STEPS: u16 = (FRAME_MAX_PAYLOAD / PROGRAM_STEP_SIZE) as u16;

// ─── Default paths ──────────────────────────────────────────────────

/// Default data directory for persisted state.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/chroma";

/// Program file name inside the data directory.
pub const PROGRAM_FILE: &str = "program.bin";

/// Reagent name-table file name inside the data directory.
pub const REAGENT_NAMES_FILE: &str = "reagent_names.bin";

/// Column name-table file name inside the data directory.
pub const COLUMN_NAMES_FILE: &str = "column_names.bin";
