use thiserror::Error;

pub const MIN_PARTICIPANTS: usize = 5;
pub const MAX_PARTICIPANTS: usize = 10;
pub const MISSION_COUNT: usize = 5;
pub const WINS_NEEDED: usize = 3;
pub const MAX_FAILED_VOTES: u32 = 5;

/// Faction of a participant. Doubles as the winning-side type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Loyal,
    Infiltrator,
}

/// Opcodes sent by the server, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerOpcode {
    GameStart = 0,
    Message = 1,
    Pm = 2,
    Error = 3,
    Card = 4,
    Vote = 5,
    EndVote = 6,
    SetLeader = 7,
    TeamAdd = 8,
    TeamRemove = 9,
    GetCard = 10,
    MissionDone = 11,
    GetName = 12,
}

/// Opcodes sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientOpcode {
    Name = 0,
    Message = 1,
    SendPm = 2,
    Approve = 3,
    Reject = 4,
    TeamAdd = 5,
    TeamRemove = 6,
    Success = 7,
    Fail = 8,
}

/// A symbolic opcode with a fixed wire byte.
pub trait Opcode: Copy {
    fn wire(self) -> u8;
}

impl Opcode for ServerOpcode {
    fn wire(self) -> u8 {
        self as u8
    }
}

impl Opcode for ClientOpcode {
    fn wire(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ServerOpcode {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(ServerOpcode::GameStart),
            1 => Ok(ServerOpcode::Message),
            2 => Ok(ServerOpcode::Pm),
            3 => Ok(ServerOpcode::Error),
            4 => Ok(ServerOpcode::Card),
            5 => Ok(ServerOpcode::Vote),
            6 => Ok(ServerOpcode::EndVote),
            7 => Ok(ServerOpcode::SetLeader),
            8 => Ok(ServerOpcode::TeamAdd),
            9 => Ok(ServerOpcode::TeamRemove),
            10 => Ok(ServerOpcode::GetCard),
            11 => Ok(ServerOpcode::MissionDone),
            12 => Ok(ServerOpcode::GetName),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

impl TryFrom<u8> for ClientOpcode {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(ClientOpcode::Name),
            1 => Ok(ClientOpcode::Message),
            2 => Ok(ClientOpcode::SendPm),
            3 => Ok(ClientOpcode::Approve),
            4 => Ok(ClientOpcode::Reject),
            5 => Ok(ClientOpcode::TeamAdd),
            6 => Ok(ClientOpcode::TeamRemove),
            7 => Ok(ClientOpcode::Success),
            8 => Ok(ClientOpcode::Fail),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload must not contain the frame terminator")]
    PayloadTerminator,
    #[error("frame carries no opcode byte")]
    EmptyFrame,
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown opcode byte {0}")]
    UnknownOpcode(u8),
}

/// Encodes one frame: opcode byte, payload parts joined with a single
/// space, newline terminator. Payloads have no escaping, so a part that
/// contains the terminator is refused outright.
pub fn encode_frame<O: Opcode>(opcode: O, parts: &[&str]) -> Result<Vec<u8>, CodecError> {
    let payload = parts.join(" ");
    if payload.contains('\n') {
        return Err(CodecError::PayloadTerminator);
    }
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(opcode.wire());
    frame.extend_from_slice(payload.as_bytes());
    frame.push(b'\n');
    Ok(frame)
}

/// Resumable per-connection frame cursor.
///
/// Reads are appended as they arrive; `next_frame` yields one complete
/// frame at a time and keeps a trailing partial frame buffered until the
/// rest of it shows up. A decode error consumes the offending frame only,
/// so the cursor stays usable for whatever follows.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends freshly read bytes to the cursor.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Yields the next terminated frame as `(opcode byte, payload)`, or
    /// `None` if the buffer holds no complete frame yet.
    pub fn next_frame(&mut self) -> Option<Result<(u8, String), CodecError>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let frame: Vec<u8> = self.buf.drain(..=pos).collect();
        let frame = &frame[..frame.len() - 1];
        if frame.is_empty() {
            return Some(Err(CodecError::EmptyFrame));
        }
        let opcode = frame[0];
        match std::str::from_utf8(&frame[1..]) {
            Ok(payload) => Some(Ok((opcode, payload.to_string()))),
            Err(_) => Some(Err(CodecError::InvalidUtf8)),
        }
    }
}

/// Required team size per round for a given participant count, or `None`
/// outside the supported 5..=10 range.
pub fn team_sizes(participants: usize) -> Option<[usize; 5]> {
    match participants {
        5 => Some([2, 3, 2, 3, 3]),
        6 => Some([2, 3, 4, 3, 4]),
        7 => Some([2, 3, 3, 4, 4]),
        8..=10 => Some([3, 4, 4, 5, 5]),
        _ => None,
    }
}

/// Number of infiltrators for a session: one third of the table, rounded up.
pub fn infiltrator_count(participants: usize) -> usize {
    (participants + 2) / 3
}
