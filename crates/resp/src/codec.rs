//! Incremental framing over a byte stream.

use crate::{value, Frame, ProtocolError, Value};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Decodes replies and encodes command frames over one connection.
#[derive(Debug, Default)]
pub struct ValueCodec;

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, ProtocolError> {
        match value::read(src)? {
            Some((value, used)) => {
                src.advance(used);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for ValueCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.put_slice(&frame.into_bytes());
        Ok(())
    }
}

// Serializing arbitrary values is the server-side half, used when replies
// are forwarded verbatim and by scripted test stores.
impl Encoder<Value> for ValueCodec {
    type Error = ProtocolError;

    fn encode(&mut self, value: Value, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        value.encode(dst);
        Ok(())
    }
}
