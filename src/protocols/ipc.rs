//! Serial inter-process message framing.
//!
//! Frame structure, full form:
//!
//! ```text
//!  0  SOF PREAMBLE (MSB=0x79)
//!  1  SOF PREAMBLE (LSB=0xBA)
//!  2  FRAME LENGTH (MSB)          length less preamble, includes CRC
//!  3  FRAME LENGTH (LSB)
//!  4  E|D|P|A|TYPE                flag bits in the upper nibble
//!  5  SEQUENCE#
//!  6  ACK/NAK SEQUENCE#
//!  7  TEXT LENGTH (MSB)
//!  8  TEXT LENGTH (LSB)
//!  .  TEXT DATA
//!  .  CRC (MSB)                   CRC-16 from offset 2 to end of text,
//!  .  CRC (LSB)                   with a fixed seed byte summed in first
//! ```
//!
//! ACK/NAK-only frames elide the sequence and text-length fields and carry
//! a fixed frame length of 4: preamble, length, type, ack-seq, CRC.

use num_enum::TryFromPrimitive;

use crate::util::crc16_update;

pub const IPC_PREAMBLE_MSB: u8 = 0x79;
pub const IPC_PREAMBLE_LSB: u8 = 0xBA;

pub const IPC_MAX_WINDOW: u8 = 8;

pub const IPC_PREAMBLE_OVERHEAD: usize = 4;
pub const IPC_HEADER_OVERHEAD: usize = 3;
pub const IPC_TEXT_OVERHEAD: usize = 2;
pub const IPC_CRC_OVERHEAD: usize = 2;
pub const IPC_FRAME_OVERHEAD: usize =
    IPC_PREAMBLE_OVERHEAD + IPC_HEADER_OVERHEAD + IPC_TEXT_OVERHEAD + IPC_CRC_OVERHEAD;

/// Both ends sum this into the CRC before any frame bytes.
pub const IPC_CRC_SEED_BYTE: u8 = 0xAB;

pub const IPC_MIN_SEQ: u8 = 1;
pub const IPC_MAX_SEQ: u8 = 3 * IPC_MAX_WINDOW;
pub const IPC_NULL_SEQ: u8 = 0;

pub const IPC_ACK_FRAME_LEN: u16 = 4;
pub const IPC_MAX_TEXT_LEN: usize = 512;
pub const IPC_MIN_FRAME_LEN: u16 = (IPC_FRAME_OVERHEAD - IPC_PREAMBLE_OVERHEAD) as u16;
pub const IPC_MAX_FRAME_LEN: u16 = IPC_MIN_FRAME_LEN + IPC_MAX_TEXT_LEN as u16;

/// Frame type flag bits (upper nibble).
pub const IPC_F_ACKNAK: u8 = 0x10;
pub const IPC_F_PRIORITY: u8 = 0x20;
pub const IPC_F_DATAGRAM: u8 = 0x40;
pub const IPC_F_ERROR: u8 = 0x80;

pub const IPC_FLAG_MASK: u8 = 0xF0;
pub const IPC_TYPE_MASK: u8 = 0x0F;

/// Frame type code (lower nibble).
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive, defmt::Format)]
#[repr(u8)]
pub enum FrameKind {
    AckOnly = 1,
    NakOnly = 2,
    MsgOnly = 3,
    /// Piggyback message plus ACK.
    MsgAck = 4,
    MsgNak = 5,
    /// User defined message packet.
    MsgUser = 6,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum IpcError {
    /// Comm port timeout / byte source ran dry before a frame started.
    Timeout,
    /// SOF frame sync error.
    Sync,
    /// Frame truncated mid-field.
    ShortFrame,
    /// Text longer than the receive buffer; frame was still drained.
    RxOverflow,
    SeqNum,
    FrameType,
    FrameLen,
    /// ACK/NAK-only frame with a bad frame length.
    AckLen,
    TextLen,
    Crc,
}

/// Advance a transmit sequence number through [IPC_MIN_SEQ, IPC_MAX_SEQ].
pub fn inc_seq(n: u8) -> u8 {
    if n >= IPC_MAX_SEQ {
        IPC_MIN_SEQ
    } else {
        n + 1
    }
}

/// Frame control block: the header fields of one frame, less the lengths.
#[derive(Clone, Copy, Default, defmt::Format)]
pub struct Fcb {
    /// Type code plus flag bits.
    pub ftype: u8,
    pub seqnum: u8,
    pub acknak: u8,
}

impl Fcb {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            ftype: kind as u8,
            seqnum: IPC_MIN_SEQ,
            acknak: IPC_NULL_SEQ,
        }
    }

    pub fn kind(&self) -> Result<FrameKind, IpcError> {
        FrameKind::try_from(self.ftype & IPC_TYPE_MASK).map_err(|_| IpcError::FrameType)
    }
}

/// Byte source for the receiver. `Err(Timeout)` means the source ran dry;
/// the framing layer maps that to `ShortFrame` once a frame has started.
pub trait ByteRead {
    fn read_byte(&mut self) -> Result<u8, IpcError>;
}

pub trait ByteWrite {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), IpcError>;
}

pub struct SliceReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.at
    }
}

impl ByteRead for SliceReader<'_> {
    fn read_byte(&mut self) -> Result<u8, IpcError> {
        if self.at >= self.buf.len() {
            return Err(IpcError::Timeout);
        }

        let b = self.buf[self.at];
        self.at += 1;
        Ok(b)
    }
}

/// Receive one frame. On success returns the number of text bytes stored
/// into `text` (zero for ACK/NAK-only frames); `fcb` is filled with the
/// frame header. Text beyond the buffer is drained and CRC-checked but not
/// stored, reported as `RxOverflow`.
pub fn frame_rx<R: ByteRead>(
    rx: &mut R,
    fcb: &mut Fcb,
    text: &mut [u8],
) -> Result<usize, IpcError> {
    let mut rc = Ok(());

    // Hunt for the 0x79 SOF byte, bailing out if flooded with garbage.
    let mut hunted = 0usize;
    loop {
        let b = rx.read_byte()?;

        if b == IPC_PREAMBLE_MSB {
            break;
        }

        hunted += 1;
        if hunted > IPC_FRAME_OVERHEAD + IPC_PREAMBLE_OVERHEAD + IPC_MAX_TEXT_LEN {
            return Err(IpcError::Sync);
        }
    }

    let b = rx.read_byte()?;
    if b != IPC_PREAMBLE_LSB {
        return Err(IpcError::Sync);
    }

    // CRC coverage starts at the frame length; sum in the seed byte first.
    let mut crc = crc16_update(0, IPC_CRC_SEED_BYTE);

    let mut next = |crc: &mut u16| -> Result<u8, IpcError> {
        let b = rx.read_byte().map_err(|_| IpcError::ShortFrame)?;
        *crc = crc16_update(*crc, b);
        Ok(b)
    };

    let msb = next(&mut crc)? as u16;
    let lsb = next(&mut crc)? as u16;
    let framelen = (msb << 8) | lsb;

    if framelen > IPC_MAX_FRAME_LEN {
        return Err(IpcError::FrameLen);
    }

    fcb.ftype = next(&mut crc)?;
    fcb.seqnum = IPC_NULL_SEQ;
    fcb.acknak = IPC_NULL_SEQ;

    let kind = fcb.ftype & IPC_TYPE_MASK;
    let acknak_only = kind == FrameKind::AckOnly as u8 || kind == FrameKind::NakOnly as u8;

    let mut stored = 0usize;

    if acknak_only {
        if framelen != IPC_ACK_FRAME_LEN {
            return Err(IpcError::AckLen);
        }

        fcb.acknak = next(&mut crc)?;
    } else {
        fcb.seqnum = next(&mut crc)?;
        fcb.acknak = next(&mut crc)?;

        let msb = next(&mut crc)? as u16;
        let lsb = next(&mut crc)? as u16;
        let textlen = ((msb << 8) | lsb) as usize;

        // The declared text plus the non-preamble overhead must equal the
        // frame length, else the frame is malformed.
        if textlen + IPC_FRAME_OVERHEAD - IPC_PREAMBLE_OVERHEAD != framelen as usize {
            return Err(IpcError::TextLen);
        }

        for i in 0..textlen {
            let b = next(&mut crc)?;

            // On overflow keep draining so the CRC still verifies, but
            // stop storing.
            if i >= text.len() {
                rc = Err(IpcError::RxOverflow);
                continue;
            }

            text[i] = b;
            stored += 1;
        }
    }

    let msb = rx.read_byte().map_err(|_| IpcError::ShortFrame)? as u16;
    let lsb = rx.read_byte().map_err(|_| IpcError::ShortFrame)? as u16;
    let rxcrc = (msb << 8) | lsb;

    if rxcrc != crc {
        return Err(IpcError::Crc);
    }

    rc.map(|_| stored)
}

/// Transmit one frame. ACK/NAK-only kinds elide the sequence and text
/// fields regardless of `text`.
pub fn frame_tx<W: ByteWrite>(w: &mut W, fcb: &mut Fcb, text: &[u8]) -> Result<(), IpcError> {
    if text.len() > IPC_MAX_TEXT_LEN {
        return Err(IpcError::TextLen);
    }

    let kind = fcb.ftype & IPC_TYPE_MASK;
    let acknak_only = kind == FrameKind::AckOnly as u8 || kind == FrameKind::NakOnly as u8;

    let (framelen, text): (u16, &[u8]) = if acknak_only {
        fcb.ftype |= IPC_F_ACKNAK;
        (IPC_ACK_FRAME_LEN, &[])
    } else {
        if kind == FrameKind::MsgAck as u8 || kind == FrameKind::MsgNak as u8 {
            fcb.ftype |= IPC_F_ACKNAK;
        } else {
            fcb.ftype &= !IPC_F_ACKNAK;
        }
        (
            (text.len() + IPC_FRAME_OVERHEAD - IPC_PREAMBLE_OVERHEAD) as u16,
            text,
        )
    };

    let mut buf = [0u8; IPC_FRAME_OVERHEAD + IPC_MAX_TEXT_LEN];
    let mut at = 0usize;
    let mut crc = crc16_update(0, IPC_CRC_SEED_BYTE);

    buf[at] = IPC_PREAMBLE_MSB;
    buf[at + 1] = IPC_PREAMBLE_LSB;
    at += 2;

    let mut push = |buf: &mut [u8; IPC_FRAME_OVERHEAD + IPC_MAX_TEXT_LEN],
                    at: &mut usize,
                    crc: &mut u16,
                    b: u8| {
        buf[*at] = b;
        *crc = crc16_update(*crc, b);
        *at += 1;
    };

    push(&mut buf, &mut at, &mut crc, (framelen >> 8) as u8);
    push(&mut buf, &mut at, &mut crc, (framelen & 0xFF) as u8);
    push(&mut buf, &mut at, &mut crc, fcb.ftype);

    if acknak_only {
        push(&mut buf, &mut at, &mut crc, fcb.acknak);
    } else {
        push(&mut buf, &mut at, &mut crc, fcb.seqnum);
        push(&mut buf, &mut at, &mut crc, fcb.acknak);
        push(&mut buf, &mut at, &mut crc, (text.len() >> 8) as u8);
        push(&mut buf, &mut at, &mut crc, (text.len() & 0xFF) as u8);

        for &b in text {
            push(&mut buf, &mut at, &mut crc, b);
        }
    }

    buf[at] = (crc >> 8) as u8;
    buf[at + 1] = (crc & 0xFF) as u8;
    at += 2;

    w.write_all(&buf[..at])
}

/// Receive-side accumulation buffer for the interrupt-driven UART path.
/// Bytes land here from the RX interrupt; the server task calls
/// `take_frame` when the line goes idle.
pub struct RxAccum {
    buf: [u8; IPC_FRAME_OVERHEAD + IPC_MAX_TEXT_LEN + 16],
    len: usize,
}

impl Default for RxAccum {
    fn default() -> Self {
        Self {
            buf: [0; IPC_FRAME_OVERHEAD + IPC_MAX_TEXT_LEN + 16],
            len: 0,
        }
    }
}

impl RxAccum {
    pub fn push(&mut self, b: u8) -> bool {
        if self.len >= self.buf.len() {
            return false;
        }

        self.buf[self.len] = b;
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn drain(&mut self, n: usize) {
        let n = n.min(self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Attempt to parse one frame from the accumulated bytes. `None` means
    /// no complete frame yet (junk is discarded, partial frames are kept).
    /// A `Some` result consumes the frame, good or bad.
    pub fn take_frame(&mut self, fcb: &mut Fcb, text: &mut [u8]) -> Option<Result<usize, IpcError>> {
        if self.len == 0 {
            return None;
        }

        let mut rd = SliceReader::new(&self.buf[..self.len]);
        let result = frame_rx(&mut rd, fcb, text);
        let consumed = rd.consumed();

        match result {
            Err(IpcError::Timeout) => {
                // Ran dry before the header: drop leading junk but keep a
                // possible frame start for the next burst.
                match self.buf[..self.len].iter().position(|&b| b == IPC_PREAMBLE_MSB) {
                    Some(0) => {}
                    Some(p) => self.drain(p),
                    None => self.len = 0,
                }
                None
            }

            Err(IpcError::ShortFrame) => {
                if self.len == self.buf.len() {
                    // Full buffer that still won't parse: not a frame.
                    // Shed a byte so the hunt can move on.
                    self.drain(1);
                }
                None
            }

            Ok(n) => {
                self.drain(consumed);
                Some(Ok(n))
            }

            Err(e) => {
                self.drain(consumed);
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecWriter(std::vec::Vec<u8>);

    impl ByteWrite for VecWriter {
        fn write_all(&mut self, buf: &[u8]) -> Result<(), IpcError> {
            self.0.extend_from_slice(buf);
            Ok(())
        }
    }

    fn tx(fcb: &mut Fcb, text: &[u8]) -> std::vec::Vec<u8> {
        let mut w = VecWriter(std::vec::Vec::new());
        frame_tx(&mut w, fcb, text).unwrap();
        w.0
    }

    #[test]
    fn round_trip_preserves_header_and_text() {
        for len in [0usize, 1, 7, 200, IPC_MAX_TEXT_LEN] {
            let text: std::vec::Vec<u8> = (0..len).map(|i| (i * 31 + 7) as u8).collect();

            let mut fcb = Fcb::new(FrameKind::MsgOnly);
            fcb.seqnum = 17;
            fcb.acknak = 4;

            let wire = tx(&mut fcb, &text);

            let mut rx_fcb = Fcb::default();
            let mut buf = [0u8; IPC_MAX_TEXT_LEN];
            let mut rd = SliceReader::new(&wire);

            let n = frame_rx(&mut rd, &mut rx_fcb, &mut buf).unwrap();

            assert_eq!(n, len);
            assert_eq!(&buf[..n], &text[..]);
            assert_eq!(rx_fcb.seqnum, 17);
            assert_eq!(rx_fcb.acknak, 4);
            assert_eq!(rx_fcb.kind().unwrap(), FrameKind::MsgOnly);
        }
    }

    #[test]
    fn ack_only_frame_is_short_form() {
        let mut fcb = Fcb::new(FrameKind::AckOnly);
        fcb.acknak = 9;

        let wire = tx(&mut fcb, &[]);

        // Preamble + length + type + ackseq + CRC.
        assert_eq!(wire.len(), 8);
        assert_eq!(&wire[..2], &[IPC_PREAMBLE_MSB, IPC_PREAMBLE_LSB]);
        assert_eq!(wire[3], IPC_ACK_FRAME_LEN as u8);

        let mut rx_fcb = Fcb::default();
        let mut rd = SliceReader::new(&wire);
        let n = frame_rx(&mut rd, &mut rx_fcb, &mut []).unwrap();

        assert_eq!(n, 0);
        assert_eq!(rx_fcb.acknak, 9);
        assert_eq!(rx_fcb.kind().unwrap(), FrameKind::AckOnly);
        assert_ne!(rx_fcb.ftype & IPC_F_ACKNAK, 0);
    }

    #[test]
    fn single_corrupt_byte_fails_crc() {
        let text = [0x55u8; 200];
        let mut fcb = Fcb::new(FrameKind::MsgOnly);
        fcb.seqnum = 3;

        let mut wire = tx(&mut fcb, &text);
        // Flip one data byte in flight.
        wire[40] ^= 0x01;

        let mut rx_fcb = Fcb::default();
        let mut buf = [0u8; IPC_MAX_TEXT_LEN];
        let mut rd = SliceReader::new(&wire);

        assert_eq!(frame_rx(&mut rd, &mut rx_fcb, &mut buf), Err(IpcError::Crc));
    }

    #[test]
    fn truncated_frame_reports_short() {
        let mut fcb = Fcb::new(FrameKind::MsgOnly);
        let wire = tx(&mut fcb, &[1, 2, 3, 4]);

        let mut rx_fcb = Fcb::default();
        let mut buf = [0u8; 16];
        let mut rd = SliceReader::new(&wire[..wire.len() - 3]);

        assert_eq!(
            frame_rx(&mut rd, &mut rx_fcb, &mut buf),
            Err(IpcError::ShortFrame)
        );
    }

    #[test]
    fn oversize_text_drains_and_flags_overflow() {
        let text = [0xA5u8; 64];
        let mut fcb = Fcb::new(FrameKind::MsgOnly);
        let wire = tx(&mut fcb, &text);

        let mut rx_fcb = Fcb::default();
        let mut small = [0u8; 16];
        let mut rd = SliceReader::new(&wire);

        // Frame drains fully and the CRC still verifies.
        assert_eq!(
            frame_rx(&mut rd, &mut rx_fcb, &mut small),
            Err(IpcError::RxOverflow)
        );
        assert_eq!(rd.consumed(), wire.len());
        assert_eq!(&small[..], &text[..16]);
    }

    #[test]
    fn mismatched_text_length_rejected() {
        let mut fcb = Fcb::new(FrameKind::MsgOnly);
        let mut wire = tx(&mut fcb, &[1, 2, 3, 4]);

        // Inflate the declared text length without fixing the frame length.
        wire[8] = 9;

        let mut rx_fcb = Fcb::default();
        let mut buf = [0u8; 16];
        let mut rd = SliceReader::new(&wire);

        assert_eq!(
            frame_rx(&mut rd, &mut rx_fcb, &mut buf),
            Err(IpcError::TextLen)
        );
    }

    #[test]
    fn receiver_syncs_past_leading_garbage() {
        let mut fcb = Fcb::new(FrameKind::MsgOnly);
        fcb.seqnum = 5;
        let frame = tx(&mut fcb, b"hello");

        let mut wire = std::vec::Vec::from(&[0x00u8, 0x12, 0x79, 0x00, 0x34][..]);
        wire.extend_from_slice(&frame);

        let mut rx_fcb = Fcb::default();
        let mut buf = [0u8; 16];
        let mut rd = SliceReader::new(&wire);

        // First attempt trips on the false 0x79 start.
        assert_eq!(frame_rx(&mut rd, &mut rx_fcb, &mut buf), Err(IpcError::Sync));

        // Second attempt from the same stream finds the real frame.
        let n = frame_rx(&mut rd, &mut rx_fcb, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn garbage_flood_reports_sync_loss() {
        let junk = [0x42u8; IPC_FRAME_OVERHEAD + IPC_PREAMBLE_OVERHEAD + IPC_MAX_TEXT_LEN + 8];

        let mut rx_fcb = Fcb::default();
        let mut buf = [0u8; 16];
        let mut rd = SliceReader::new(&junk);

        assert_eq!(frame_rx(&mut rd, &mut rx_fcb, &mut buf), Err(IpcError::Sync));
    }

    #[test]
    fn accum_parses_frames_across_bursts() {
        let mut fcb = Fcb::new(FrameKind::MsgOnly);
        fcb.seqnum = 2;
        let wire = tx(&mut fcb, b"split");

        let mut accum = RxAccum::default();
        let mut rx_fcb = Fcb::default();
        let mut buf = [0u8; 32];

        let (a, b) = wire.split_at(6);

        for &byte in a {
            assert!(accum.push(byte));
        }
        // First burst alone: incomplete, nothing consumed destructively.
        assert!(accum.take_frame(&mut rx_fcb, &mut buf).is_none());

        for &byte in b {
            assert!(accum.push(byte));
        }

        let n = accum.take_frame(&mut rx_fcb, &mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"split");
        assert_eq!(accum.len(), 0);
    }

    #[test]
    fn accum_discards_junk_between_frames() {
        let mut fcb = Fcb::new(FrameKind::MsgOnly);
        let wire = tx(&mut fcb, b"ok");

        let mut accum = RxAccum::default();
        for b in [0x11u8, 0x22, 0x33] {
            accum.push(b);
        }
        for &b in &wire {
            accum.push(b);
        }

        let mut rx_fcb = Fcb::default();
        let mut buf = [0u8; 8];

        let n = accum.take_frame(&mut rx_fcb, &mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"ok");
        assert_eq!(accum.len(), 0);
    }

    #[test]
    fn sequence_numbers_wrap_within_window_range() {
        let mut seq = IPC_MIN_SEQ;
        for _ in 0..100 {
            assert!(seq >= IPC_MIN_SEQ && seq <= IPC_MAX_SEQ);
            seq = inc_seq(seq);
        }
        assert_eq!(inc_seq(IPC_MAX_SEQ), IPC_MIN_SEQ);
    }
}
