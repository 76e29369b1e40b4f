//! Command dispatch: maps verified frame payloads onto the control core.
//!
//! The dispatcher runs in the communication task. It owns the program
//! write path (upload cursor, name tables) and reaches the device only
//! through the atomic handles, so control-task state is never touched
//! from here.
//!
//! Upload contract: `InitProgramWrite` aborts any execution and clears
//! the program; subsequent `WriteProgramBlock`s append monotonically
//! until the next init. Blocks that would overrun the capacity are
//! trimmed and acknowledged with [`AckCode::ProgramOverflow`].

use std::sync::Arc;

use chroma_common::program::{NameTable, Program, ProgramLoader};
use chroma_common::state::DeviceState;
use chroma_control::{DeviceHandle, ExecutorHandle, PumpCommand};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::command::{AckCode, CommandId};

/// A dispatch result: either a one-byte ack or a data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack(AckCode),
    Data(Vec<u8>),
}

impl Response {
    /// The response payload as sent on the wire.
    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Response::Ack(code) => vec![code as u8],
            Response::Data(bytes) => bytes,
        }
    }
}

/// Command dispatcher for one link connection.
pub struct Dispatcher {
    device: DeviceHandle,
    executor: ExecutorHandle,
    program: Arc<RwLock<Program>>,
    reagent_names: Arc<RwLock<NameTable>>,
    column_names: Arc<RwLock<NameTable>>,
    loader: ProgramLoader,
}

impl Dispatcher {
    pub fn new(
        device: DeviceHandle,
        executor: ExecutorHandle,
        program: Arc<RwLock<Program>>,
        reagent_names: Arc<RwLock<NameTable>>,
        column_names: Arc<RwLock<NameTable>>,
    ) -> Self {
        Self {
            device,
            executor,
            program,
            reagent_names,
            column_names,
            loader: ProgramLoader::new(),
        }
    }

    /// Handle one verified payload: `command_id | args…`.
    pub fn handle(&mut self, payload: &[u8]) -> Response {
        let Some((&id_byte, args)) = payload.split_first() else {
            return Response::Ack(AckCode::Unknown);
        };
        let Some(id) = CommandId::from_u8(id_byte) else {
            warn!(id = id_byte, "unknown command id");
            return Response::Ack(AckCode::Unknown);
        };
        debug!(?id, args_len = args.len(), "dispatching command");

        match id {
            CommandId::Ping => Response::Ack(AckCode::Ok),

            CommandId::SetValves => {
                let [reagent, column, ..] = args else {
                    return Response::Ack(AckCode::Unknown);
                };
                self.device.set_valves(*reagent, *column);
                Response::Ack(AckCode::Ok)
            }

            CommandId::SetPump => match PumpCommand::decode(args) {
                Some(cmd) => {
                    self.device.set_pump(cmd);
                    Response::Ack(AckCode::Ok)
                }
                None => Response::Ack(AckCode::Unknown),
            },

            // Weight-sensor path is not populated on current hardware;
            // the protocol slot stays acknowledged.
            CommandId::GetWeight | CommandId::TareWeight => Response::Ack(AckCode::Ok),

            CommandId::InitProgramWrite => {
                self.executor.abort();
                self.loader.reset(&mut self.program.write());
                Response::Ack(AckCode::Ok)
            }

            CommandId::WriteProgramBlock => {
                let offered = (args.len() / chroma_common::consts::PROGRAM_STEP_SIZE) as u16;
                let stored = self
                    .loader
                    .load_from_buffer(&mut self.program.write(), args);
                if stored < offered {
                    warn!(offered, stored, "program block overran capacity");
                    Response::Ack(AckCode::ProgramOverflow)
                } else {
                    Response::Ack(AckCode::Ok)
                }
            }

            CommandId::ExecuteProgram => {
                self.executor.start();
                Response::Ack(AckCode::Ok)
            }

            CommandId::ReadProgramBlock => {
                if args.len() < 4 {
                    return Response::Ack(AckCode::Unknown);
                }
                let start = u16::from_be_bytes([args[0], args[1]]);
                // One frame carries at most LINK_MAX_BLOCK_STEPS steps.
                let count = u16::from_be_bytes([args[2], args[3]])
                    .min(chroma_common::consts::LINK_MAX_BLOCK_STEPS);
                Response::Data(self.program.read().read_block(start, count))
            }

            CommandId::GetProgramLength => {
                let length = self.program.read().len();
                let mut out = Vec::with_capacity(4);
                out.extend_from_slice(&length.to_be_bytes());
                out.extend_from_slice(&Program::capacity().to_be_bytes());
                Response::Data(out)
            }

            CommandId::GetReagents => Response::Data(self.reagent_names.read().to_bytes()),
            CommandId::GetColumns => Response::Data(self.column_names.read().to_bytes()),

            CommandId::SetReagents => {
                self.reagent_names.write().set_from_bytes(args);
                Response::Ack(AckCode::Ok)
            }
            CommandId::SetColumns => {
                self.column_names.write().set_from_bytes(args);
                Response::Ack(AckCode::Ok)
            }

            CommandId::AbortProgram => {
                self.executor.abort();
                Response::Ack(AckCode::Ok)
            }

            CommandId::GetDeviceState => {
                Response::Data(self.device.state().to_bytes().to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chroma_common::program::ProgramStep;
    use chroma_control::handle::{PumpSetpointCell, ValveRequestCell};
    use chroma_control::ProgramExecutor;

    struct Harness {
        dispatcher: Dispatcher,
        pump_cell: Arc<PumpSetpointCell>,
        valve_cell: Arc<ValveRequestCell>,
        program: Arc<RwLock<Program>>,
        state: Arc<RwLock<DeviceState>>,
        executor: ExecutorHandle,
    }

    fn harness() -> Harness {
        let pump_cell = PumpSetpointCell::new();
        let valve_cell = ValveRequestCell::new();
        let state = Arc::new(RwLock::new(DeviceState::default()));
        let device = DeviceHandle::new(pump_cell.clone(), valve_cell.clone(), state.clone());

        let program = Arc::new(RwLock::new(Program::new()));
        let (_executor, executor_handle) = ProgramExecutor::new(program.clone());

        let dispatcher = Dispatcher::new(
            device,
            executor_handle.clone(),
            program.clone(),
            Arc::new(RwLock::new(NameTable::reagent_defaults())),
            Arc::new(RwLock::new(NameTable::column_defaults())),
        );
        Harness {
            dispatcher,
            pump_cell,
            valve_cell,
            program,
            state,
            executor: executor_handle,
        }
    }

    fn step_block(steps: &[ProgramStep]) -> Vec<u8> {
        let mut payload = vec![CommandId::WriteProgramBlock as u8];
        for step in steps {
            payload.extend_from_slice(&step.encode());
        }
        payload
    }

    #[test]
    fn ping_acks_ok() {
        let mut h = harness();
        assert_eq!(h.dispatcher.handle(&[0]), Response::Ack(AckCode::Ok));
    }

    #[test]
    fn unknown_command_acks_one() {
        let mut h = harness();
        assert_eq!(h.dispatcher.handle(&[42]), Response::Ack(AckCode::Unknown));
        assert_eq!(
            Response::Ack(AckCode::Unknown).into_payload(),
            vec![1u8]
        );
    }

    #[test]
    fn set_valves_reaches_the_cell() {
        let mut h = harness();
        assert_eq!(
            h.dispatcher.handle(&[1, 2, 3]),
            Response::Ack(AckCode::Ok)
        );
        assert_eq!(h.valve_cell.take(), Some((2, 3)));
    }

    #[test]
    fn set_valves_rejects_short_args() {
        let mut h = harness();
        assert_eq!(h.dispatcher.handle(&[1, 2]), Response::Ack(AckCode::Unknown));
        assert!(h.valve_cell.take().is_none());
    }

    #[test]
    fn set_pump_decodes_payload() {
        let mut h = harness();
        let cmd = PumpCommand {
            flow_rate: -4.5,
            acceleration: 2.0,
        };
        let mut payload = vec![2u8];
        payload.extend_from_slice(&cmd.encode());
        assert_eq!(h.dispatcher.handle(&payload), Response::Ack(AckCode::Ok));
        assert_eq!(h.pump_cell.take(), Some(cmd));

        assert_eq!(
            h.dispatcher.handle(&[2, 0, 0, 0]),
            Response::Ack(AckCode::Unknown)
        );
    }

    #[test]
    fn program_upload_flow() {
        let mut h = harness();
        // init → two blocks → length check → read back
        assert_eq!(h.dispatcher.handle(&[4]), Response::Ack(AckCode::Ok));

        let steps: Vec<ProgramStep> = (0..15)
            .map(|i| ProgramStep::flush(i % 6, (i + 1) % 6, 1.0, 10.0))
            .collect();
        assert_eq!(
            h.dispatcher.handle(&step_block(&steps)),
            Response::Ack(AckCode::Ok)
        );
        assert_eq!(
            h.dispatcher.handle(&step_block(&steps[..5])),
            Response::Ack(AckCode::Ok)
        );
        assert_eq!(h.program.read().len(), 20);

        // get_program_length → length 20, capacity 4096, both BE.
        let response = h.dispatcher.handle(&[8]);
        assert_eq!(
            response,
            Response::Data(vec![0x00, 20, 0x10, 0x00])
        );

        // read_program_block of steps 15..20.
        let response = h
            .dispatcher
            .handle(&[7, 0x00, 15, 0x00, 5]);
        let Response::Data(bytes) = response else {
            panic!("expected data");
        };
        assert_eq!(bytes.len(), 5 * 16);
        assert_eq!(ProgramStep::decode(&bytes).unwrap(), steps[0]);
    }

    #[test]
    fn init_program_write_clears_and_aborts() {
        let mut h = harness();
        h.dispatcher.handle(&[4]);
        h.dispatcher
            .handle(&step_block(&[ProgramStep::wait(1.0)]));
        assert_eq!(h.program.read().len(), 1);

        h.dispatcher.handle(&[4]);
        assert_eq!(h.program.read().len(), 0);
        // A fresh upload restarts at index 0.
        h.dispatcher
            .handle(&step_block(&[ProgramStep::wait(2.0)]));
        assert_eq!(h.program.read().len(), 1);
        assert_eq!(h.program.read().read_at(0).unwrap().duration, 2.0);
    }

    #[test]
    fn overflowing_block_acks_overflow_code() {
        let mut h = harness();
        h.dispatcher.handle(&[4]);

        // 273 full blocks of 15 steps leave exactly one free slot.
        let fifteen: Vec<ProgramStep> = (0..15).map(|_| ProgramStep::wait(1.0)).collect();
        for _ in 0..273 {
            assert_eq!(
                h.dispatcher.handle(&step_block(&fifteen)),
                Response::Ack(AckCode::Ok)
            );
        }
        assert_eq!(h.program.read().len(), Program::capacity() - 1);

        // Two more steps: the first fits, the second is dropped.
        let response = h
            .dispatcher
            .handle(&step_block(&[ProgramStep::wait(1.0), ProgramStep::wait(2.0)]));
        assert_eq!(response, Response::Ack(AckCode::ProgramOverflow));
        assert_eq!(h.program.read().len(), Program::capacity());
    }

    #[test]
    fn read_block_count_is_capped_to_frame_size() {
        let mut h = harness();
        h.dispatcher.handle(&[4]);
        let response = h.dispatcher.handle(&[7, 0, 0, 0xFF, 0xFF]);
        let Response::Data(bytes) = response else {
            panic!("expected data");
        };
        assert_eq!(bytes.len(), 15 * 16);
    }

    #[test]
    fn execute_and_abort_reach_the_executor() {
        let mut h = harness();
        assert_eq!(h.dispatcher.handle(&[6]), Response::Ack(AckCode::Ok));
        assert_eq!(h.dispatcher.handle(&[13]), Response::Ack(AckCode::Ok));
        // Both requests are mailboxed; nothing observable here beyond the
        // acks, the control task consumes them on its next tick.
        let _ = &h.executor;
    }

    #[test]
    fn name_tables_roundtrip_over_the_link() {
        let mut h = harness();
        let Response::Data(bytes) = h.dispatcher.handle(&[9]) else {
            panic!("expected data");
        };
        assert_eq!(bytes.len(), NameTable::BYTE_LEN);
        assert!(bytes.starts_with(b"Reagent_1\0"));

        // Rename reagent 0, read it back.
        let mut payload = vec![11u8];
        let mut table = NameTable::from_bytes(&bytes).unwrap();
        table.set_from_bytes(b"Methanol\0");
        payload.extend_from_slice(&table.to_bytes());
        assert_eq!(h.dispatcher.handle(&payload), Response::Ack(AckCode::Ok));

        let Response::Data(bytes) = h.dispatcher.handle(&[9]) else {
            panic!("expected data");
        };
        assert!(bytes.starts_with(b"Methanol\0"));

        // Columns are independent.
        let Response::Data(bytes) = h.dispatcher.handle(&[10]) else {
            panic!("expected data");
        };
        assert!(bytes.starts_with(b"Column_1\0"));
    }

    #[test]
    fn get_device_state_ships_the_snapshot() {
        let mut h = harness();
        h.state.write().pump_speed = 2.5;
        h.state.write().running = 1;
        let Response::Data(bytes) = h.dispatcher.handle(&[14]) else {
            panic!("expected data");
        };
        let state = DeviceState::from_bytes(&bytes).unwrap();
        assert_eq!(state.pump_speed, 2.5);
        assert_eq!(state.running, 1);
    }

    #[test]
    fn reserved_commands_ack_ok() {
        let mut h = harness();
        assert_eq!(h.dispatcher.handle(&[3]), Response::Ack(AckCode::Ok));
        assert_eq!(h.dispatcher.handle(&[15]), Response::Ack(AckCode::Ok));
    }
}
