//! Wire protocol
//!
//! Inbound commands (UDP datagrams and framed TCP commands) start with a line
//! holding a decimal command code; the rest of the payload is the argument.
//!
//! Outbound messages are framed as:
//!
//! ```text
//! +-------------+--------------+---------+
//! | length (5)  | keyword (12) | payload |
//! +-------------+--------------+---------+
//! ```
//!
//! where `length` is the zero-padded lowercase hex length of keyword + payload.

use crate::error::{Result, StationError};
use bytes::{BufMut, Bytes, BytesMut};
use kestrel_core::QuestionKind;

pub const LENGTH_FIELD_LEN: usize = 5;
pub const KEYWORD_LEN: usize = 12;
/// Largest keyword + payload the length field can describe.
pub const MAX_FRAME_BODY: usize = 0xF_FFFF;

/// Outbound message keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    BoardInfo,
    AuthLevel,
    FileList,
    FileData,
    TestData,
    DiagnosticData,
    MessageBoxOpen,
    MessageBoxClose,
    RepairLock,
    Error,
}

impl Keyword {
    pub const ALL: [Keyword; 10] = [
        Keyword::BoardInfo,
        Keyword::AuthLevel,
        Keyword::FileList,
        Keyword::FileData,
        Keyword::TestData,
        Keyword::DiagnosticData,
        Keyword::MessageBoxOpen,
        Keyword::MessageBoxClose,
        Keyword::RepairLock,
        Keyword::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::BoardInfo => "BOARD_INFO__",
            Keyword::AuthLevel => "AUTH_LEVEL__",
            Keyword::FileList => "FILE_LIST___",
            Keyword::FileData => "FILE_DATA___",
            Keyword::TestData => "TEST_DATA___",
            Keyword::DiagnosticData => "DIAG_DATA___",
            Keyword::MessageBoxOpen => "MSGBOX_OPEN_",
            Keyword::MessageBoxClose => "MSGBOX_CLOSE",
            Keyword::RepairLock => "REPAIR_LOCK_",
            Keyword::Error => "ERROR_______",
        }
    }

    pub fn parse(raw: &[u8]) -> Option<Keyword> {
        Self::ALL.into_iter().find(|k| k.as_str().as_bytes() == raw)
    }
}

/// Build an outbound frame.
pub fn encode_frame(keyword: Keyword, payload: &[u8]) -> Result<Bytes> {
    let body_len = KEYWORD_LEN + payload.len();
    if body_len > MAX_FRAME_BODY {
        return Err(StationError::Protocol(format!(
            "Outbound frame body of {} bytes exceeds the {} byte length field",
            body_len, MAX_FRAME_BODY
        )));
    }

    let mut frame = BytesMut::with_capacity(LENGTH_FIELD_LEN + body_len);
    frame.put_slice(format!("{:05x}", body_len).as_bytes());
    frame.put_slice(keyword.as_str().as_bytes());
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// The 17-byte close-dialog frame.
pub fn close_dialog_frame() -> Bytes {
    let mut frame = BytesMut::with_capacity(LENGTH_FIELD_LEN + KEYWORD_LEN);
    frame.put_slice(format!("{:05x}", KEYWORD_LEN).as_bytes());
    frame.put_slice(Keyword::MessageBoxClose.as_str().as_bytes());
    frame.freeze()
}

/// Parse the length field of an outbound frame, returning the body length.
pub fn parse_length_field(raw: &[u8]) -> Result<usize> {
    if raw.len() != LENGTH_FIELD_LEN {
        return Err(StationError::Protocol("Truncated length field".to_string()));
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| StationError::Protocol("Length field is not ASCII".to_string()))?;
    let len = usize::from_str_radix(text, 16)
        .map_err(|_| StationError::Protocol(format!("Invalid length field: {text:?}")))?;
    if len < KEYWORD_LEN {
        return Err(StationError::Protocol(format!(
            "Frame body of {len} bytes is shorter than a keyword"
        )));
    }
    Ok(len)
}

/// Split a frame body into keyword and payload.
pub fn split_body(body: &[u8]) -> Result<(Keyword, &[u8])> {
    if body.len() < KEYWORD_LEN {
        return Err(StationError::Protocol("Frame body too short".to_string()));
    }
    let (raw, payload) = body.split_at(KEYWORD_LEN);
    let keyword = Keyword::parse(raw).ok_or_else(|| {
        StationError::Protocol(format!(
            "Unknown keyword {:?}",
            String::from_utf8_lossy(raw)
        ))
    })?;
    Ok((keyword, payload))
}

/// Payload of a question fan-out: kind tag, question text and, for binary
/// kinds, the pipe-delimited list of valid answers.
pub fn question_payload(text: &str, kind: QuestionKind) -> String {
    let mut payload = format!("{}\n{}", kind.tag(), text);
    for answer in kind.valid_answers() {
        payload.push('|');
        payload.push_str(answer);
    }
    payload
}

/// Split an inbound command into its numeric code and argument.
pub fn split_command(payload: &[u8]) -> Result<(u16, &[u8])> {
    let (header, rest) = match payload.iter().position(|&b| b == b'\n') {
        Some(i) => (&payload[..i], &payload[i + 1..]),
        None => (payload, &payload[payload.len()..]),
    };
    let header = std::str::from_utf8(header)
        .map_err(|_| StationError::Protocol("Command header is not UTF-8".to_string()))?;
    let code = header
        .trim()
        .parse::<u16>()
        .map_err(|_| StationError::Protocol(format!("Invalid command code: {header:?}")))?;
    Ok((code, rest))
}

/// Build an inbound command as a client would send it.
pub fn encode_command(code: u16, argument: &str, terminator_len: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + argument.len() + terminator_len);
    out.put_slice(code.to_string().as_bytes());
    if !argument.is_empty() {
        out.put_u8(b'\n');
        out.put_slice(argument.as_bytes());
    }
    out.put_bytes(b'\n', terminator_len);
    out.freeze()
}

/// Discovery (UDP) command family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryCommand {
    /// A scanning client looking for any station
    InitialBroadcast = 1,
    /// A client re-finding the boards it already knows
    DefaultBroadcast = 2,
    UserAuthentication = 3,
    /// A client announcing it is going away
    Disconnect = 4,
}

impl TryFrom<u16> for DiscoveryCommand {
    type Error = StationError;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(DiscoveryCommand::InitialBroadcast),
            2 => Ok(DiscoveryCommand::DefaultBroadcast),
            3 => Ok(DiscoveryCommand::UserAuthentication),
            4 => Ok(DiscoveryCommand::Disconnect),
            _ => Err(StationError::Protocol(format!(
                "Invalid discovery code: {}",
                value
            ))),
        }
    }
}

/// Stream (TCP) command family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    GetFile = 10,
    GetTestData = 11,
    GetTestUpdateData = 12,
    GetLastTestUpdateData = 13,
    QuestionResponse = 14,
    RepairLockBoard = 15,
    RepairUnlockBoard = 16,
    ReleaseQuestionHold = 17,
    // Station-generated only; rejected when they arrive from the network.
    CloseDialog = 90,
    PushTestUpdate = 91,
}

impl StreamCommand {
    /// Commands that are only ever queued by the station itself.
    pub fn is_loopback(&self) -> bool {
        matches!(self, StreamCommand::CloseDialog | StreamCommand::PushTestUpdate)
    }

    /// Commands that may run while a question is gating the queue.
    pub fn bypasses_question_gate(&self) -> bool {
        matches!(
            self,
            StreamCommand::QuestionResponse
                | StreamCommand::ReleaseQuestionHold
                | StreamCommand::CloseDialog
        )
    }
}

impl TryFrom<u16> for StreamCommand {
    type Error = StationError;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            10 => Ok(StreamCommand::GetFile),
            11 => Ok(StreamCommand::GetTestData),
            12 => Ok(StreamCommand::GetTestUpdateData),
            13 => Ok(StreamCommand::GetLastTestUpdateData),
            14 => Ok(StreamCommand::QuestionResponse),
            15 => Ok(StreamCommand::RepairLockBoard),
            16 => Ok(StreamCommand::RepairUnlockBoard),
            17 => Ok(StreamCommand::ReleaseQuestionHold),
            90 => Ok(StreamCommand::CloseDialog),
            91 => Ok(StreamCommand::PushTestUpdate),
            _ => Err(StationError::Protocol(format!(
                "Invalid stream code: {}",
                value
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_fixed_width_and_unique() {
        for keyword in Keyword::ALL {
            assert_eq!(keyword.as_str().len(), KEYWORD_LEN, "{keyword:?}");
            assert_eq!(Keyword::parse(keyword.as_str().as_bytes()), Some(keyword));
        }
    }

    #[test]
    fn close_dialog_is_seventeen_bytes() {
        let frame = close_dialog_frame();
        assert_eq!(frame.len(), 17);
        assert_eq!(&frame[..], b"0000cMSGBOX_CLOSE");
        assert_eq!(
            encode_frame(Keyword::MessageBoxClose, b"").ok(),
            Some(frame)
        );
    }

    #[test]
    fn frame_length_counts_keyword_and_payload() -> Result<()> {
        let frame = encode_frame(Keyword::RepairLock, b"LOCKED")?;
        assert_eq!(&frame[..5], b"00012");
        let len = parse_length_field(&frame[..5])?;
        assert_eq!(len, frame.len() - LENGTH_FIELD_LEN);
        let (keyword, payload) = split_body(&frame[5..])?;
        assert_eq!(keyword, Keyword::RepairLock);
        assert_eq!(payload, b"LOCKED");
        Ok(())
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let payload = vec![b'a'; MAX_FRAME_BODY];
        assert!(encode_frame(Keyword::FileData, &payload).is_err());
    }

    #[test]
    fn question_payload_lists_answers() {
        assert_eq!(
            question_payload("Fan spinning?", QuestionKind::YesNo),
            "YESNO\nFan spinning?|YES|NO"
        );
        assert_eq!(
            question_payload("Reseat DIMM", QuestionKind::RetryFail),
            "RETRYFAIL\nReseat DIMM|RETRY|FAIL"
        );
        assert_eq!(
            question_payload("Enter tag", QuestionKind::FreeText),
            "TEXT\nEnter tag"
        );
    }

    #[test]
    fn split_command_with_and_without_argument() -> Result<()> {
        let (code, arg) = split_command(b"14\nNO")?;
        assert_eq!(code, 14);
        assert_eq!(arg, b"NO");

        let (code, arg) = split_command(b"12")?;
        assert_eq!(code, 12);
        assert!(arg.is_empty());

        assert!(split_command(b"abc\nx").is_err());
        Ok(())
    }

    #[test]
    fn encode_command_appends_terminator() {
        assert_eq!(&encode_command(14, "YES", 3)[..], b"14\nYES\n\n\n");
        assert_eq!(&encode_command(12, "", 3)[..], b"12\n\n\n");
    }

    #[test]
    fn command_codes_round_trip() {
        for code in [10u16, 11, 12, 13, 14, 15, 16, 17, 90, 91] {
            let command = StreamCommand::try_from(code).map(|c| c as u16).ok();
            assert_eq!(command, Some(code));
        }
        assert!(StreamCommand::try_from(42).is_err());
        assert!(DiscoveryCommand::try_from(5).is_err());
        assert!(StreamCommand::CloseDialog.is_loopback());
        assert!(!StreamCommand::GetFile.is_loopback());
    }
}
