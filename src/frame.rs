//! Wire framing shared by every connection.
//!
//! ```text
//! message: 0x00 | len: u32 LE | payload (len <= MAX_MESSAGE_SIZE)
//! stream:  0x01 | raw bytes, length known from the preceding header message
//! ```

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::transport::TransportError;
use crate::MAX_MESSAGE_SIZE;

pub const TAG_MESSAGE: u8 = 0x0;
pub const TAG_STREAM: u8 = 0x1;

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Message(Vec<u8>),
    Stream,
}

/// Build the full wire form of a control message.
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(1 + 4 + payload.len());
    frame.push(TAG_MESSAGE);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read the next unit. For a stream only the tag is consumed.
///
/// Any error here leaves the connection at an unknown offset, so the caller
/// must drop the connection rather than keep reading.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await? {
        TAG_STREAM => Ok(Frame::Stream),
        TAG_MESSAGE => {
            let len = reader.read_u32_le().await? as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(TransportError::MessageTooLarge(len));
            }

            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;
            Ok(Frame::Message(payload))
        }
        tag => Err(TransportError::UnknownTag(tag)),
    }
}
