//! Program steps, bounded program storage and name tables.
//!
//! The 16-byte step wire layout is frozen: persisted programs and
//! protocol blocks must stay readable across firmware revisions, so the
//! codec writes bytes explicitly instead of relying on struct layout.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
    NAME_LEN, NUM_COLUMNS, NUM_REAGENTS, PORT_KEEP_CURRENT, PROGRAM_MAX_STEPS, PROGRAM_STEP_SIZE,
};

// ─── Program Step ───────────────────────────────────────────────────

/// One fluidic program instruction.
///
/// Ports are logical (0–5); [`PORT_KEEP_CURRENT`] leaves the valve where
/// it is. `volume` and `duration` use `+∞` for "no limit"; a step with
/// both infinite runs until aborted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgramStep {
    /// Inlet reagent port, or 0xFF to keep the current position.
    pub reagent_port: u8,
    /// Outlet column port, or 0xFF to keep the current position.
    pub column_port: u8,
    /// Commanded flow [mL/min]; sign selects direction.
    pub flow_rate: f32,
    /// Volume limit [mL]; `+∞` = unlimited.
    pub volume: f32,
    /// Time limit [s]; `+∞` = unlimited.
    pub duration: f32,
}

impl Default for ProgramStep {
    fn default() -> Self {
        Self {
            reagent_port: PORT_KEEP_CURRENT,
            column_port: PORT_KEEP_CURRENT,
            flow_rate: 0.0,
            volume: f32::INFINITY,
            duration: f32::INFINITY,
        }
    }
}

impl ProgramStep {
    /// A time-terminated flush through the given ports.
    pub fn flush(reagent_port: u8, column_port: u8, flow_rate: f32, duration_s: f32) -> Self {
        Self {
            reagent_port,
            column_port,
            flow_rate,
            volume: f32::INFINITY,
            duration: duration_s,
        }
    }

    /// A pause: valves untouched, pump stopped, for the given time.
    pub fn wait(duration_s: f32) -> Self {
        Self {
            reagent_port: PORT_KEEP_CURRENT,
            column_port: PORT_KEEP_CURRENT,
            flow_rate: 0.0,
            volume: f32::INFINITY,
            duration: duration_s,
        }
    }

    /// True when the step pauses instead of flushing.
    pub fn is_wait(&self) -> bool {
        self.flow_rate == 0.0 && self.reagent_port == PORT_KEEP_CURRENT
    }

    /// True when the step leaves both valves untouched.
    pub fn keeps_valves(&self) -> bool {
        self.reagent_port == PORT_KEEP_CURRENT || self.column_port == PORT_KEEP_CURRENT
    }

    /// Encode into the frozen 16-byte wire layout:
    /// `reagent | column | 0 | 0 | flow LE | volume LE | duration LE`.
    /// The two zero bytes keep the floats 4-byte aligned.
    pub fn encode(&self) -> [u8; PROGRAM_STEP_SIZE] {
        let mut out = [0u8; PROGRAM_STEP_SIZE];
        out[0] = self.reagent_port;
        out[1] = self.column_port;
        out[4..8].copy_from_slice(&self.flow_rate.to_le_bytes());
        out[8..12].copy_from_slice(&self.volume.to_le_bytes());
        out[12..16].copy_from_slice(&self.duration.to_le_bytes());
        out
    }

    /// Decode from the wire layout. Returns `None` when the slice is short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PROGRAM_STEP_SIZE {
            return None;
        }
        Some(Self {
            reagent_port: bytes[0],
            column_port: bytes[1],
            flow_rate: f32::from_le_bytes(bytes[4..8].try_into().ok()?),
            volume: f32::from_le_bytes(bytes[8..12].try_into().ok()?),
            duration: f32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }
}

// ─── Program ────────────────────────────────────────────────────────

/// Error type for program mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProgramError {
    /// The program is at capacity; the step was not stored.
    #[error("program full ({0} steps)")]
    Full(u16),
    /// Write index beyond the current length.
    #[error("write index {idx} beyond length {len}")]
    IndexBeyondEnd { idx: u16, len: u16 },
}

/// An ordered, bounded sequence of program steps.
///
/// Length grows monotonically between [`Program::clear`] calls. Reads of
/// indices at or beyond the length yield default (inert) steps so block
/// reads never expose stale memory.
#[derive(Debug, Clone, Default)]
pub struct Program {
    steps: Vec<ProgramStep>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of steps.
    pub fn len(&self) -> u16 {
        self.steps.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Capacity in steps.
    pub const fn capacity() -> u16 {
        PROGRAM_MAX_STEPS
    }

    /// Drop all steps.
    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Store `step` at `idx`, extending the program by one when
    /// `idx == len`. Appends past capacity are refused.
    pub fn write_at(&mut self, idx: u16, step: ProgramStep) -> Result<(), ProgramError> {
        let len = self.len();
        if idx < len {
            self.steps[idx as usize] = step;
            Ok(())
        } else if idx == len {
            if len >= PROGRAM_MAX_STEPS {
                return Err(ProgramError::Full(len));
            }
            self.steps.push(step);
            Ok(())
        } else {
            Err(ProgramError::IndexBeyondEnd { idx, len })
        }
    }

    /// Read the step at `idx`; `None` beyond the current length.
    pub fn read_at(&self, idx: u16) -> Option<ProgramStep> {
        self.steps.get(idx as usize).copied()
    }

    /// Serialize `count` steps starting at `start` into raw wire bytes.
    /// Indices beyond the length encode as default steps.
    pub fn read_block(&self, start: u16, count: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(count as usize * PROGRAM_STEP_SIZE);
        for i in 0..count {
            let step = self
                .read_at(start.saturating_add(i))
                .unwrap_or_default();
            out.extend_from_slice(&step.encode());
        }
        out
    }

    /// Iterate over the stored steps.
    pub fn iter(&self) -> impl Iterator<Item = &ProgramStep> {
        self.steps.iter()
    }

    /// Serialize into the persistence image: `u16` LE length followed by
    /// the raw step bytes.
    pub fn to_file_image(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.steps.len() * PROGRAM_STEP_SIZE);
        out.extend_from_slice(&self.len().to_le_bytes());
        for step in &self.steps {
            out.extend_from_slice(&step.encode());
        }
        out
    }

    /// Parse a persistence image. Returns `None` when the image is
    /// truncated or declares more steps than the capacity allows.
    pub fn from_file_image(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }
        let len = u16::from_le_bytes([bytes[0], bytes[1]]);
        if len > PROGRAM_MAX_STEPS {
            return None;
        }
        let body = &bytes[2..];
        if body.len() < len as usize * PROGRAM_STEP_SIZE {
            return None;
        }
        let mut program = Program::new();
        for i in 0..len as usize {
            let step = ProgramStep::decode(&body[i * PROGRAM_STEP_SIZE..])?;
            program.steps.push(step);
        }
        Some(program)
    }
}

// ─── Program Loader ─────────────────────────────────────────────────

/// Sequential block loader for multi-frame program uploads.
///
/// The link delivers programs in blocks of at most
/// [`crate::consts::LINK_MAX_BLOCK_STEPS`] steps; the loader keeps the
/// append cursor between blocks. `reset` marks an upload boundary.
#[derive(Debug, Default)]
pub struct ProgramLoader {
    cursor: u16,
}

impl ProgramLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the target program and rewind the cursor.
    pub fn reset(&mut self, program: &mut Program) {
        self.cursor = 0;
        program.clear();
    }

    /// Append every whole 16-byte step in `buffer`.
    ///
    /// Returns the number of steps stored. Steps that would exceed the
    /// program capacity are dropped.
    pub fn load_from_buffer(&mut self, program: &mut Program, buffer: &[u8]) -> u16 {
        let mut stored = 0;
        for chunk in buffer.chunks_exact(PROGRAM_STEP_SIZE) {
            let step = match ProgramStep::decode(chunk) {
                Some(step) => step,
                None => break,
            };
            match program.write_at(self.cursor, step) {
                Ok(()) => {
                    self.cursor += 1;
                    stored += 1;
                }
                Err(ProgramError::Full(_)) => break,
                Err(ProgramError::IndexBeyondEnd { .. }) => {
                    // Cursor out of sync with the program (cleared behind
                    // our back); realign to append.
                    self.cursor = program.len();
                    if program.write_at(self.cursor, step).is_ok() {
                        self.cursor += 1;
                        stored += 1;
                    } else {
                        break;
                    }
                }
            }
        }
        stored
    }
}

// ─── Name Tables ────────────────────────────────────────────────────

/// Fixed table of six 40-byte ASCII names for reagents or columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTable {
    names: [[u8; NAME_LEN]; NUM_REAGENTS],
}

impl NameTable {
    /// Total wire size of the table [bytes].
    pub const BYTE_LEN: usize = NAME_LEN * NUM_REAGENTS;

    /// Build a table of `Prefix_1 … Prefix_6` defaults.
    pub fn with_prefix(prefix: &str) -> Self {
        let mut names = [[0u8; NAME_LEN]; NUM_REAGENTS];
        for (i, slot) in names.iter_mut().enumerate() {
            let name = format!("{prefix}_{}", i + 1);
            let bytes = name.as_bytes();
            let n = bytes.len().min(NAME_LEN - 1);
            slot[..n].copy_from_slice(&bytes[..n]);
        }
        Self { names }
    }

    /// Default reagent names.
    pub fn reagent_defaults() -> Self {
        Self::with_prefix("Reagent")
    }

    /// Default column names.
    pub fn column_defaults() -> Self {
        Self::with_prefix("Column")
    }

    /// Overwrite from raw wire bytes; a short buffer updates a prefix of
    /// the table and leaves the rest untouched.
    pub fn set_from_bytes(&mut self, bytes: &[u8]) {
        let flat: &mut [u8] = self.names.as_flattened_mut();
        let n = bytes.len().min(Self::BYTE_LEN);
        flat[..n].copy_from_slice(&bytes[..n]);
    }

    /// Serialize the whole table.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.names.as_flattened().to_vec()
    }

    /// Parse from raw bytes; `None` when fewer than
    /// [`NameTable::BYTE_LEN`] bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::BYTE_LEN {
            return None;
        }
        let mut names = [[0u8; NAME_LEN]; NUM_REAGENTS];
        for (i, slot) in names.iter_mut().enumerate() {
            slot.copy_from_slice(&bytes[i * NAME_LEN..(i + 1) * NAME_LEN]);
        }
        Some(Self { names })
    }

    /// The name at `idx`, trimmed at the first NUL.
    pub fn name(&self, idx: usize) -> &str {
        let slot = &self.names[idx];
        let end = slot.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        std::str::from_utf8(&slot[..end]).unwrap_or("")
    }
}

const _: () = assert!(NUM_REAGENTS == NUM_COLUMNS);
