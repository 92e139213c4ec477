//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call signaling messages.
//!
//! A message is a list of `[tag][len][value]` fields ending with a zero byte.
//! Every field value is a single byte.

use std::{
    fmt,
    ops::{BitAnd, BitOr},
};

use strum_macros::{Display, EnumIter};
use thiserror::Error;
use toxav_common::{BytesReader, Writable, Writer};

/// Packet id of signaling messages on the lossless channel.
pub const MSI_PACKET_ID: u8 = 69;
pub const MAX_MESSAGE_LEN: usize = 256;

const TAG_END: u8 = 0;
const TAG_REQUEST: u8 = 1;
const TAG_ERROR: u8 = 2;
const TAG_CAPABILITIES: u8 = 3;
const FIELD_VALUE_LEN: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is empty")]
    Empty,
    #[error("message of {0} bytes is too long")]
    TooLong(usize),
    #[error("message doesn't end with a terminator")]
    MissingTerminator,
    #[error("unexpected packet id {0}")]
    InvalidPacketId(u8),
    #[error("unknown field tag {0}")]
    UnknownTag(u8),
    #[error("field {tag} has length {len}")]
    InvalidFieldLength { tag: u8, len: u8 },
    #[error("field extends past the end of the message")]
    Truncated,
    #[error("invalid request {0}")]
    InvalidRequest(u8),
    #[error("invalid error code {0}")]
    InvalidErrorCode(u8),
    #[error("message has no request")]
    MissingRequest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum Request {
    Init = 0,
    Push = 1,
    Pop = 2,
}

impl TryFrom<u8> for Request {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Init),
            1 => Ok(Self::Push),
            2 => Ok(Self::Pop),
            _ => Err(ParseError::InvalidRequest(value)),
        }
    }
}

/// Why a call was ended by one side, carried in an error message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum ErrorCode {
    #[default]
    None = 0,
    InvalidMessage = 1,
    InvalidParam = 2,
    InvalidState = 3,
    StrayMessage = 4,
    System = 5,
    Handle = 6,
    Undisclosed = 7,
}

impl TryFrom<u8> for ErrorCode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::None,
            1 => Self::InvalidMessage,
            2 => Self::InvalidParam,
            3 => Self::InvalidState,
            4 => Self::StrayMessage,
            5 => Self::System,
            6 => Self::Handle,
            7 => Self::Undisclosed,
            _ => return Err(ParseError::InvalidErrorCode(value)),
        })
    }
}

/// What a side of a call sends and wants to receive.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const SEND_AUDIO: Self = Self(1 << 2);
    pub const SEND_VIDEO: Self = Self(1 << 3);
    pub const RECEIVE_AUDIO: Self = Self(1 << 4);
    pub const RECEIVE_VIDEO: Self = Self(1 << 5);

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Unknown bits are kept so they can be echoed back.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for Capabilities {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SEND_AUDIO, "send_audio"),
            (Self::SEND_VIDEO, "send_video"),
            (Self::RECEIVE_AUDIO, "receive_audio"),
            (Self::RECEIVE_VIDEO, "receive_video"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{:#04x}[{}]", self.0, set.join("|"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub request: Request,
    pub error: Option<ErrorCode>,
    pub capabilities: Option<Capabilities>,
}

impl Message {
    pub fn new(request: Request, capabilities: Capabilities) -> Self {
        Self {
            request,
            error: None,
            capabilities: Some(capabilities),
        }
    }

    pub fn pop() -> Self {
        Self {
            request: Request::Pop,
            error: None,
            capabilities: None,
        }
    }

    pub fn error(error: ErrorCode) -> Self {
        Self {
            request: Request::Pop,
            error: Some(error),
            capabilities: None,
        }
    }

    /// Parses a message without the packet id.
    pub fn parse(message: &[u8]) -> Result<Self, ParseError> {
        match message.last() {
            None => return Err(ParseError::Empty),
            Some(&TAG_END) => {}
            Some(_) => return Err(ParseError::MissingTerminator),
        }
        if message.len() > MAX_MESSAGE_LEN {
            return Err(ParseError::TooLong(message.len()));
        }

        let mut reader = BytesReader::from_slice(message);
        let mut request = None;
        let mut error = None;
        let mut capabilities = None;
        loop {
            let tag = reader.read_u8().map_err(|_| ParseError::Truncated)?;
            if tag == TAG_END {
                break;
            }
            if !matches!(tag, TAG_REQUEST | TAG_ERROR | TAG_CAPABILITIES) {
                return Err(ParseError::UnknownTag(tag));
            }
            let len = reader.read_u8().map_err(|_| ParseError::Truncated)?;
            if len != FIELD_VALUE_LEN {
                return Err(ParseError::InvalidFieldLength { tag, len });
            }
            // The value must leave room for the terminator.
            if reader.remaining() <= len as usize {
                return Err(ParseError::Truncated);
            }
            let value = reader.read_u8().map_err(|_| ParseError::Truncated)?;
            match tag {
                TAG_REQUEST => request = Some(Request::try_from(value)?),
                TAG_ERROR => error = Some(ErrorCode::try_from(value)?),
                _ => capabilities = Some(Capabilities::from_bits(value)),
            }
        }

        Ok(Self {
            request: request.ok_or(ParseError::MissingRequest)?,
            error,
            capabilities,
        })
    }

    /// Parses a packet from the lossless channel.
    pub fn parse_packet(packet: &[u8]) -> Result<Self, ParseError> {
        match packet.split_first() {
            Some((&MSI_PACKET_ID, message)) => Self::parse(message),
            Some((packet_id, _)) => Err(ParseError::InvalidPacketId(*packet_id)),
            None => Err(ParseError::Empty),
        }
    }

    pub fn to_packet(&self) -> Vec<u8> {
        ([MSI_PACKET_ID], self).to_vec()
    }
}

impl Writer for Message {
    fn written_len(&self) -> usize {
        let field_len = 2 + FIELD_VALUE_LEN as usize;
        field_len
            * (1 + self.error.is_some() as usize + self.capabilities.is_some() as usize)
            + 1
    }

    fn write(&self, out: &mut dyn Writable) {
        (
            [TAG_REQUEST, FIELD_VALUE_LEN, self.request as u8],
            self.error
                .map(|error| [TAG_ERROR, FIELD_VALUE_LEN, error as u8]),
            self.capabilities.map(|capabilities| {
                [TAG_CAPABILITIES, FIELD_VALUE_LEN, capabilities.bits()]
            }),
            [TAG_END],
        )
            .write(out)
    }
}
