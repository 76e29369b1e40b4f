//! Command identifiers and ack codes.

/// Ack codes returned in single-byte ack payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckCode {
    /// Command accepted.
    Ok = 0,
    /// Unknown command id or malformed arguments.
    Unknown = 1,
    /// Program write would exceed capacity; excess steps were dropped.
    ProgramOverflow = 2,
}

/// Command ids carried in the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    Ping = 0,
    SetValves = 1,
    SetPump = 2,
    GetWeight = 3,
    InitProgramWrite = 4,
    WriteProgramBlock = 5,
    ExecuteProgram = 6,
    ReadProgramBlock = 7,
    GetProgramLength = 8,
    GetReagents = 9,
    GetColumns = 10,
    SetReagents = 11,
    SetColumns = 12,
    AbortProgram = 13,
    GetDeviceState = 14,
    /// Weight-sensor tare; disabled hardware path, still acknowledged.
    TareWeight = 15,
}

impl CommandId {
    /// Convert from raw `u8`. Returns `None` for unassigned ids.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ping),
            1 => Some(Self::SetValves),
            2 => Some(Self::SetPump),
            3 => Some(Self::GetWeight),
            4 => Some(Self::InitProgramWrite),
            5 => Some(Self::WriteProgramBlock),
            6 => Some(Self::ExecuteProgram),
            7 => Some(Self::ReadProgramBlock),
            8 => Some(Self::GetProgramLength),
            9 => Some(Self::GetReagents),
            10 => Some(Self::GetColumns),
            11 => Some(Self::SetReagents),
            12 => Some(Self::SetColumns),
            13 => Some(Self::AbortProgram),
            14 => Some(Self::GetDeviceState),
            15 => Some(Self::TareWeight),
            _ => None,
        }
    }
}
