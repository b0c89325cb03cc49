use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::Result;

/// Serialize a message into the bytes written as one frame
pub fn encode<M: Serialize + ?Sized>(msg: &M) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Deserialize a response frame, for use inside a response decoder
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Wrap a negotiated stream in the length-delimited framing both ends speak
pub fn framed<S>(stream: S, max_message_size: usize) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_message_size)
        .new_codec();
    Framed::new(stream, codec)
}
