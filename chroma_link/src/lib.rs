//! # Chroma Command Link
//!
//! Length-prefixed, CRC32-checked request/response protocol over a
//! reliable serial transport, plus the dispatcher that maps commands
//! onto the control-core handles.
//!
//! Frame layout: `0x21 0x37 | LEN | PAYLOAD | CRC32 (big-endian)`, where
//! `LEN` counts payload plus CRC. The CRC covers the payload only.
//! Malformed frames are dropped silently; the receiver resynchronizes on
//! the next start sequence.

pub mod command;
pub mod dispatch;
pub mod frame;
pub mod transport;

pub use command::{AckCode, CommandId};
pub use dispatch::{Dispatcher, Response};
pub use frame::{crc32_ieee, encode_frame, FrameDecoder, FrameError};
pub use transport::{open_serial, run_link, LinkError};
