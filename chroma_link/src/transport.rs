//! Serial transport loop for the command link.
//!
//! The receive path reads with a short timeout so the task stays
//! responsive to shutdown while idle; once a frame is in progress the
//! decoder keeps its state across reads, so a frame spanning read
//! boundaries still completes. The loop is generic over
//! `Read + Write`, which lets tests drive it with in-memory streams.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chroma_common::config::LinkConfig;
use chroma_common::consts::LINK_RECEIVE_TIMEOUT_MS;
use serialport::SerialPort;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::frame::{encode_frame, FrameDecoder};

/// Error type for link transport operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open the configured serial device at 8N1 with the receive timeout.
pub fn open_serial(config: &LinkConfig) -> Result<Box<dyn SerialPort>, LinkError> {
    let device = config
        .serial_device
        .as_deref()
        .unwrap_or("/dev/ttyUSB0");
    let port = serialport::new(device, config.baud_rate)
        .timeout(Duration::from_millis(LINK_RECEIVE_TIMEOUT_MS))
        .open()?;
    info!(device, baud = config.baud_rate, "serial link open");
    Ok(port)
}

/// Receive frames and dispatch commands until `shutdown` is set or the
/// stream ends.
///
/// Frame-level errors (bad start bytes, bad length, CRC mismatch) are
/// swallowed by the decoder; no ack is produced for them. Write errors
/// terminate the loop and are returned so the caller can reopen the
/// transport.
pub fn run_link<T: Read + Write>(
    io: &mut T,
    dispatcher: &mut Dispatcher,
    shutdown: &AtomicBool,
) -> Result<(), LinkError> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 256];

    while !shutdown.load(Ordering::Acquire) {
        let n = match io.read(&mut buf) {
            Ok(0) => {
                debug!("link stream closed");
                return Ok(());
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => {
                warn!("link read error: {e}");
                return Err(e.into());
            }
        };

        for &byte in &buf[..n] {
            let Some(payload) = decoder.push(byte) else {
                continue;
            };
            let response = dispatcher.handle(&payload).into_payload();
            match encode_frame(&response) {
                Ok(frame) => io.write_all(&frame)?,
                // Responses are bounded by construction; oversized data
                // here is a programming error, not a link condition.
                Err(e) => warn!("unencodable response: {e}"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::AckCode;
    use chroma_common::program::{NameTable, Program};
    use chroma_common::state::DeviceState;
    use chroma_control::handle::{DeviceHandle, PumpSetpointCell, ValveRequestCell};
    use chroma_control::ProgramExecutor;
    use parking_lot::RwLock;
    use std::sync::Arc;

    /// In-memory duplex: reads from a script, collects writes.
    struct MockIo {
        incoming: std::io::Cursor<Vec<u8>>,
        outgoing: Vec<u8>,
    }

    impl Read for MockIo {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for MockIo {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        let state = Arc::new(RwLock::new(DeviceState::default()));
        let device = DeviceHandle::new(PumpSetpointCell::new(), ValveRequestCell::new(), state);
        let program = Arc::new(RwLock::new(Program::new()));
        let (_executor, handle) = ProgramExecutor::new(program.clone());
        Dispatcher::new(
            device,
            handle,
            program,
            Arc::new(RwLock::new(NameTable::reagent_defaults())),
            Arc::new(RwLock::new(NameTable::column_defaults())),
        )
    }

    #[test]
    fn ping_roundtrip_over_the_wire() {
        let ping = encode_frame(&[0x00]).unwrap();
        let mut io = MockIo {
            incoming: std::io::Cursor::new(ping.clone()),
            outgoing: Vec::new(),
        };
        let shutdown = AtomicBool::new(false);
        run_link(&mut io, &mut dispatcher(), &shutdown).unwrap();
        // Ack 0 is byte-identical to the ping frame.
        assert_eq!(io.outgoing, ping);
    }

    #[test]
    fn corrupt_crc_gets_no_ack_and_next_ping_works() {
        let ping = encode_frame(&[0x00]).unwrap();
        let mut corrupted = ping.clone();
        *corrupted.last_mut().unwrap() ^= 0xFF;

        let mut stream = corrupted;
        stream.extend_from_slice(&ping);
        let mut io = MockIo {
            incoming: std::io::Cursor::new(stream),
            outgoing: Vec::new(),
        };
        let shutdown = AtomicBool::new(false);
        run_link(&mut io, &mut dispatcher(), &shutdown).unwrap();
        // Exactly one ack: the corrupted frame was dropped silently.
        assert_eq!(io.outgoing, ping);
    }

    #[test]
    fn multiple_commands_in_one_stream() {
        let mut stream = encode_frame(&[0x00]).unwrap();
        stream.extend_from_slice(&encode_frame(&[42]).unwrap()); // unknown id
        let mut io = MockIo {
            incoming: std::io::Cursor::new(stream),
            outgoing: Vec::new(),
        };
        let shutdown = AtomicBool::new(false);
        run_link(&mut io, &mut dispatcher(), &shutdown).unwrap();

        let mut expected = encode_frame(&[AckCode::Ok as u8]).unwrap();
        expected.extend_from_slice(&encode_frame(&[AckCode::Unknown as u8]).unwrap());
        assert_eq!(io.outgoing, expected);
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let mut io = MockIo {
            incoming: std::io::Cursor::new(Vec::new()),
            outgoing: Vec::new(),
        };
        let shutdown = AtomicBool::new(true);
        run_link(&mut io, &mut dispatcher(), &shutdown).unwrap();
        assert!(io.outgoing.is_empty());
    }
}
