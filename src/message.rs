use crate::error::Error;
use crate::frame::{Frame, OpCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    // Converts a collapsed data frame into a Message variant
    pub fn from_frame(frame: Frame) -> Result<Self, Error> {
        match frame.opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(frame.payload)?)),
            OpCode::Binary => Ok(Message::Binary(frame.payload)),
            _ => Err(Error::InvalidOpcode(frame.opcode.as_u8())),
        }
    }

    // Same conversion without the strict UTF-8 gate: invalid sequences in a
    // text payload are replaced instead of failing the connection.
    pub fn from_frame_lossy(frame: Frame) -> Self {
        match frame.opcode {
            OpCode::Text => Message::Text(String::from_utf8_lossy(&frame.payload).into_owned()),
            _ => Message::Binary(frame.payload),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }

    // Function to get the payload as binary (Vec<u8>)
    pub fn as_binary(&self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) => data.clone(),
        }
    }

    // Function to get the payload as a String
    pub fn as_text(&self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text.clone()),
            Message::Binary(data) => Ok(String::from_utf8(data.clone())?),
        }
    }
}
