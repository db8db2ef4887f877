//! Command messages carried over the IPC frame link, and the server-side
//! dispatcher. The companion controller is the client; every correctly
//! received request is answered with a message-plus-ACK or a bare ACK/NAK
//! carrying the client's sequence number.

use num_enum::TryFromPrimitive;

use crate::{
    params::{make_rev, SystemParams, FIRMWARE_BUILD, FIRMWARE_REV, FIRMWARE_VER, PARAMS_WIRE_SIZE},
    protocols::ipc::{inc_seq, Fcb, FrameKind, IPC_MIN_SEQ},
    state::ServoMode,
    transport_ctrls::sequencer::{CmdMailbox, ModeFlags, TransportCmd},
};

/// Message header: opcode plus total message length, both little-endian.
pub const MSG_HDR_SIZE: usize = 4;

/// Reply buffer large enough for the config record plus header.
pub const MSG_BUF_SIZE: usize = MSG_HDR_SIZE + PARAMS_WIRE_SIZE + 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive, defmt::Format)]
#[repr(u16)]
pub enum Opcode {
    VersionGet = 1,
    /// Store/recall config EEPROM.
    ConfigEprom = 100,
    ConfigGet = 101,
    ConfigSet = 102,
    TransportCmd = 200,
}

/// Transport command requests.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive, defmt::Format)]
#[repr(i32)]
pub enum TransportRequest {
    Stop = 0,
    Play = 1,
    Fwd = 2,
    FwdLib = 3,
    Rew = 4,
    RewLib = 5,
}

/// `param1` flag for PLAY: engage record once rolling.
pub const P1_RECORD: u16 = 0x80;
/// `param2` flags for FWD/REW.
pub const P2_NOSLOW: u16 = 0x20;
pub const P2_LIBWIND: u16 = 0x40;

/// EEPROM op selectors for `ConfigEprom`.
pub const EPROM_LOAD: i32 = 0;
pub const EPROM_SAVE: i32 = 1;
pub const EPROM_DEFAULTS: i32 = 2;

/// The non-volatile side of the parameter record, as the dispatcher sees
/// it. Statuses follow the storage convention: 0 clean, -1 when defaults
/// had to be restored or the write failed.
pub trait ParamStore {
    fn load(&mut self, params: &mut SystemParams) -> i32;
    fn save(&mut self, params: &SystemParams) -> i32;
    fn defaults(&mut self, params: &mut SystemParams);
}

fn rd_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn rd_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn wr_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn wr_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn wr_i32(buf: &mut [u8], at: usize, v: i32) {
    wr_u32(buf, at, v as u32);
}

/// Server-side dispatcher state: just the transmit sequence counter.
pub struct IpcServer {
    tx_seq: u8,
}

impl Default for IpcServer {
    fn default() -> Self {
        Self {
            tx_seq: IPC_MIN_SEQ,
        }
    }
}

impl IpcServer {
    fn next_seq(&mut self) -> u8 {
        let seq = self.tx_seq;
        self.tx_seq = inc_seq(seq);
        seq
    }

    fn ack(&mut self, req: &Fcb) -> (Fcb, usize) {
        let mut fcb = Fcb::new(FrameKind::AckOnly);
        fcb.acknak = req.seqnum;
        (fcb, 0)
    }

    fn nak(&mut self, req: &Fcb) -> (Fcb, usize) {
        let mut fcb = Fcb::new(FrameKind::NakOnly);
        fcb.acknak = req.seqnum;
        (fcb, 0)
    }

    fn msg_ack(&mut self, req: &Fcb, len: usize) -> (Fcb, usize) {
        let mut fcb = Fcb::new(FrameKind::MsgAck);
        fcb.seqnum = self.next_seq();
        fcb.acknak = req.seqnum;
        (fcb, len)
    }

    /// Dispatch one received request. Returns the reply frame header and
    /// the number of reply text bytes written into `reply`.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &mut self,
        req_fcb: &Fcb,
        req: &[u8],
        reply: &mut [u8],
        params: &mut SystemParams,
        store: &mut impl ParamStore,
        mbox: &mut CmdMailbox,
        servo_mode: ServoMode,
    ) -> (Fcb, usize) {
        if req.len() < MSG_HDR_SIZE {
            return self.nak(req_fcb);
        }

        let opcode = match Opcode::try_from(rd_u16(req, 0)) {
            Ok(op) => op,
            Err(_) => return self.nak(req_fcb),
        };

        match opcode {
            Opcode::VersionGet => {
                let msglen = MSG_HDR_SIZE + 8;
                wr_u16(reply, 0, Opcode::VersionGet as u16);
                wr_u16(reply, 2, msglen as u16);
                wr_u32(reply, 4, make_rev(FIRMWARE_VER, FIRMWARE_REV));
                wr_u32(reply, 8, FIRMWARE_BUILD);
                self.msg_ack(req_fcb, msglen)
            }

            Opcode::ConfigEprom => {
                if req.len() < MSG_HDR_SIZE + 8 {
                    return self.nak(req_fcb);
                }

                let op = rd_i32(req, 4);

                let status = match op {
                    EPROM_LOAD => store.load(params),
                    EPROM_SAVE => store.save(params),
                    EPROM_DEFAULTS => {
                        store.defaults(params);
                        0
                    }
                    _ => 1,
                };

                let msglen = MSG_HDR_SIZE + 8;
                wr_u16(reply, 0, Opcode::ConfigEprom as u16);
                wr_u16(reply, 2, msglen as u16);
                wr_i32(reply, 4, op);
                wr_i32(reply, 8, status);
                self.msg_ack(req_fcb, msglen)
            }

            Opcode::ConfigGet => {
                let msglen = MSG_HDR_SIZE + PARAMS_WIRE_SIZE;
                wr_u16(reply, 0, Opcode::ConfigGet as u16);
                wr_u16(reply, 2, msglen as u16);

                // The record in runtime memory, which may differ from the
                // EEPROM copy if settings were changed.
                if params.encode(&mut reply[MSG_HDR_SIZE..]).is_err() {
                    return self.nak(req_fcb);
                }

                self.msg_ack(req_fcb, msglen)
            }

            Opcode::ConfigSet => {
                if req.len() < MSG_HDR_SIZE + PARAMS_WIRE_SIZE {
                    return self.nak(req_fcb);
                }

                // Replaces the record in runtime memory only; a ConfigEprom
                // store request persists it.
                match SystemParams::decode(&req[MSG_HDR_SIZE..]) {
                    Ok(new) => {
                        *params = new;
                        self.ack(req_fcb)
                    }
                    Err(_) => self.nak(req_fcb),
                }
            }

            Opcode::TransportCmd => {
                if req.len() < MSG_HDR_SIZE + 8 {
                    return self.nak(req_fcb);
                }

                // No transport motion commands while halted (no tape).
                if servo_mode == ServoMode::Halt {
                    return self.nak(req_fcb);
                }

                let cmd = match TransportRequest::try_from(rd_i32(req, 4)) {
                    Ok(c) => c,
                    Err(_) => return self.nak(req_fcb),
                };

                let param1 = rd_u16(req, 8);
                let param2 = rd_u16(req, 10);

                let cmd = match cmd {
                    TransportRequest::Stop => TransportCmd::SetMode {
                        mode: ServoMode::Stop,
                        flags: ModeFlags::default(),
                        velocity: None,
                    },

                    TransportRequest::Play => TransportCmd::SetMode {
                        mode: ServoMode::Play,
                        flags: ModeFlags {
                            record: param1 & P1_RECORD != 0,
                            ..Default::default()
                        },
                        velocity: None,
                    },

                    TransportRequest::Fwd | TransportRequest::Rew => TransportCmd::SetMode {
                        mode: if cmd == TransportRequest::Fwd {
                            ServoMode::Fwd
                        } else {
                            ServoMode::Rew
                        },
                        flags: ModeFlags {
                            record: false,
                            libwind: param2 & P2_LIBWIND != 0,
                            noslow: param2 & P2_NOSLOW != 0,
                        },
                        velocity: (param1 > 0).then_some(param1),
                    },

                    TransportRequest::FwdLib | TransportRequest::RewLib => TransportCmd::SetMode {
                        mode: if cmd == TransportRequest::FwdLib {
                            ServoMode::Fwd
                        } else {
                            ServoMode::Rew
                        },
                        flags: ModeFlags {
                            record: false,
                            libwind: true,
                            noslow: true,
                        },
                        velocity: None,
                    },
                };

                mbox.post(cmd);
                self.ack(req_fcb)
            }
        }
    }
}

/// Build a request message header in place; used by the firmware's own
/// datagram notifications and by the tests.
pub fn write_msg_hdr(buf: &mut [u8], opcode: Opcode, msglen: usize) {
    wr_u16(buf, 0, opcode as u16);
    wr_u16(buf, 2, msglen as u16);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TapeWidth;
    use crate::protocols::ipc::{frame_rx, frame_tx, ByteWrite, IpcError, SliceReader};

    struct MockStore {
        saved: Option<SystemParams>,
        load_status: i32,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                saved: None,
                load_status: 0,
            }
        }
    }

    impl ParamStore for MockStore {
        fn load(&mut self, params: &mut SystemParams) -> i32 {
            if let Some(saved) = &self.saved {
                *params = saved.clone();
            }
            self.load_status
        }

        fn save(&mut self, params: &SystemParams) -> i32 {
            self.saved = Some(params.clone());
            0
        }

        fn defaults(&mut self, params: &mut SystemParams) {
            *params = SystemParams::defaults(TapeWidth::Two);
        }
    }

    struct Bench {
        server: IpcServer,
        params: SystemParams,
        store: MockStore,
        mbox: CmdMailbox,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                server: IpcServer::default(),
                params: SystemParams::defaults(TapeWidth::Two),
                store: MockStore::new(),
                mbox: CmdMailbox::default(),
            }
        }

        fn dispatch(&mut self, req: &[u8], servo_mode: ServoMode) -> (Fcb, std::vec::Vec<u8>) {
            let mut req_fcb = Fcb::new(crate::protocols::ipc::FrameKind::MsgOnly);
            req_fcb.seqnum = 7;

            let mut reply = [0u8; MSG_BUF_SIZE];
            let (fcb, len) = self.server.dispatch(
                &req_fcb,
                req,
                &mut reply,
                &mut self.params,
                &mut self.store,
                &mut self.mbox,
                servo_mode,
            );

            (fcb, reply[..len].to_vec())
        }
    }

    #[test]
    fn version_get_returns_firmware_identity() {
        let mut b = Bench::new();

        let mut req = [0u8; MSG_HDR_SIZE];
        write_msg_hdr(&mut req, Opcode::VersionGet, MSG_HDR_SIZE);

        let (fcb, reply) = b.dispatch(&req, ServoMode::Stop);

        assert_eq!(fcb.kind().unwrap(), crate::protocols::ipc::FrameKind::MsgAck);
        assert_eq!(fcb.acknak, 7);
        assert_eq!(reply.len(), 12);
        assert_eq!(
            u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]),
            make_rev(FIRMWARE_VER, FIRMWARE_REV)
        );
        assert_eq!(
            u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]),
            FIRMWARE_BUILD
        );
    }

    #[test]
    fn config_set_then_get_round_trips_bytewise() {
        let mut b = Bench::new();

        let mut modified = SystemParams::defaults(TapeWidth::Two);
        modified.shuttle_velocity = 777;
        modified.play_lo_boost_pgain = 2.25;

        let mut req = [0u8; MSG_HDR_SIZE + PARAMS_WIRE_SIZE];
        let req_len = req.len();
        write_msg_hdr(&mut req, Opcode::ConfigSet, req_len);
        modified.encode(&mut req[MSG_HDR_SIZE..]).unwrap();

        let (fcb, _) = b.dispatch(&req, ServoMode::Stop);
        assert_eq!(fcb.kind().unwrap(), crate::protocols::ipc::FrameKind::AckOnly);
        assert_eq!(b.params.shuttle_velocity, 777);

        // Get must return the runtime record bytewise.
        let mut get = [0u8; MSG_HDR_SIZE];
        write_msg_hdr(&mut get, Opcode::ConfigGet, MSG_HDR_SIZE);

        let (_, reply) = b.dispatch(&get, ServoMode::Stop);
        assert_eq!(reply.len(), MSG_HDR_SIZE + PARAMS_WIRE_SIZE);
        assert_eq!(&reply[MSG_HDR_SIZE..], &req[MSG_HDR_SIZE..]);
    }

    #[test]
    fn config_eprom_save_persists_runtime_record() {
        let mut b = Bench::new();
        b.params.shuttle_velocity = 555;

        let mut req = [0u8; MSG_HDR_SIZE + 8];
        let req_len = req.len();
        write_msg_hdr(&mut req, Opcode::ConfigEprom, req_len);
        req[4..8].copy_from_slice(&EPROM_SAVE.to_le_bytes());

        let (fcb, reply) = b.dispatch(&req, ServoMode::Stop);

        assert_eq!(fcb.kind().unwrap(), crate::protocols::ipc::FrameKind::MsgAck);
        // Status word is the last i32 of the reply.
        assert_eq!(
            i32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]),
            0
        );
        assert_eq!(b.store.saved.as_ref().unwrap().shuttle_velocity, 555);
    }

    #[test]
    fn transport_cmd_queues_mode_change() {
        let mut b = Bench::new();

        let mut req = [0u8; MSG_HDR_SIZE + 8];
        let req_len = req.len();
        write_msg_hdr(&mut req, Opcode::TransportCmd, req_len);
        req[4..8].copy_from_slice(&(TransportRequest::Fwd as i32).to_le_bytes());
        wr_u16(&mut req, 8, 800); // velocity override
        wr_u16(&mut req, 10, P2_NOSLOW);

        let (fcb, _) = b.dispatch(&req, ServoMode::Stop);
        assert_eq!(fcb.kind().unwrap(), crate::protocols::ipc::FrameKind::AckOnly);

        match b.mbox.pend() {
            Some(TransportCmd::SetMode {
                mode,
                flags,
                velocity,
            }) => {
                assert_eq!(mode, ServoMode::Fwd);
                assert!(flags.noslow);
                assert!(!flags.libwind);
                assert_eq!(velocity, Some(800));
            }
            other => panic!("unexpected command {:?}", other.is_some()),
        }
    }

    #[test]
    fn transport_play_with_record_flag() {
        let mut b = Bench::new();

        let mut req = [0u8; MSG_HDR_SIZE + 8];
        let req_len = req.len();
        write_msg_hdr(&mut req, Opcode::TransportCmd, req_len);
        req[4..8].copy_from_slice(&(TransportRequest::Play as i32).to_le_bytes());
        wr_u16(&mut req, 8, P1_RECORD);

        b.dispatch(&req, ServoMode::Stop);

        match b.mbox.pend() {
            Some(TransportCmd::SetMode { mode, flags, .. }) => {
                assert_eq!(mode, ServoMode::Play);
                assert!(flags.record);
            }
            _ => panic!("no command queued"),
        }
    }

    #[test]
    fn transport_cmd_refused_while_halted() {
        let mut b = Bench::new();

        let mut req = [0u8; MSG_HDR_SIZE + 8];
        let req_len = req.len();
        write_msg_hdr(&mut req, Opcode::TransportCmd, req_len);
        req[4..8].copy_from_slice(&(TransportRequest::Play as i32).to_le_bytes());

        let (fcb, _) = b.dispatch(&req, ServoMode::Halt);

        assert_eq!(fcb.kind().unwrap(), crate::protocols::ipc::FrameKind::NakOnly);
        assert!(b.mbox.pend().is_none());
    }

    #[test]
    fn unknown_opcode_naks() {
        let mut b = Bench::new();

        let mut req = [0u8; MSG_HDR_SIZE];
        wr_u16(&mut req, 0, 9_999);
        wr_u16(&mut req, 2, MSG_HDR_SIZE as u16);

        let (fcb, _) = b.dispatch(&req, ServoMode::Stop);
        assert_eq!(fcb.kind().unwrap(), crate::protocols::ipc::FrameKind::NakOnly);
        assert_eq!(fcb.acknak, 7);
    }

    #[test]
    fn full_link_round_trip() {
        // Client encodes a VERSION_GET request frame; server parses it,
        // dispatches, and its reply frame decodes cleanly.
        struct VecWriter(std::vec::Vec<u8>);

        impl ByteWrite for VecWriter {
            fn write_all(&mut self, buf: &[u8]) -> Result<(), IpcError> {
                self.0.extend_from_slice(buf);
                Ok(())
            }
        }

        let mut req_text = [0u8; MSG_HDR_SIZE];
        write_msg_hdr(&mut req_text, Opcode::VersionGet, MSG_HDR_SIZE);

        let mut client_fcb = Fcb::new(crate::protocols::ipc::FrameKind::MsgOnly);
        client_fcb.seqnum = 12;

        let mut wire = VecWriter(std::vec::Vec::new());
        frame_tx(&mut wire, &mut client_fcb, &req_text).unwrap();

        // Server side.
        let mut rx_fcb = Fcb::default();
        let mut rx_text = [0u8; MSG_BUF_SIZE];
        let mut rd = SliceReader::new(&wire.0);
        let n = frame_rx(&mut rd, &mut rx_fcb, &mut rx_text).unwrap();

        let mut b = Bench::new();
        let mut reply = [0u8; MSG_BUF_SIZE];
        let (mut reply_fcb, len) = b.server.dispatch(
            &rx_fcb,
            &rx_text[..n],
            &mut reply,
            &mut b.params,
            &mut b.store,
            &mut b.mbox,
            ServoMode::Stop,
        );

        let mut reply_wire = VecWriter(std::vec::Vec::new());
        frame_tx(&mut reply_wire, &mut reply_fcb, &reply[..len]).unwrap();

        // Client decodes the reply.
        let mut client_rx = Fcb::default();
        let mut client_buf = [0u8; MSG_BUF_SIZE];
        let mut rd = SliceReader::new(&reply_wire.0);
        let m = frame_rx(&mut rd, &mut client_rx, &mut client_buf).unwrap();

        assert_eq!(client_rx.acknak, 12);
        assert_eq!(m, 12);
        assert_eq!(rd_u16(&client_buf, 0), Opcode::VersionGet as u16);
    }
}
