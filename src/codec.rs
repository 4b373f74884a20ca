//! Message serialization and stream framing.
//!
//! A connection turns bytes into messages in two steps. A [`Framer`] finds frame boundaries in the
//! read buffer and a [`Coder`] turns each frame body into a message. Outgoing messages take the
//! reverse path. [`FrameCodec`] glues a framer and a coder into a
//! [`tokio_util::codec::Decoder`]/[`Encoder`] pair, which is what the connection loops drive.
//!
//! Built-in coders:
//!
//! | Name      | Type             | Messages                                   |
//! |-----------|------------------|--------------------------------------------|
//! | `json`    | [`JsonCoder`]    | any `Serialize + DeserializeOwned` type    |
//! | `msgpack` | [`MsgPackCoder`] | any `Serialize + DeserializeOwned` type    |
//! | `bytes`   | [`BytesCoder`]   | [`Bytes`](bytes::Bytes), passed through     |
//! | `utf8`    | [`Utf8Coder`]    | `String`                                   |
//!
//! Built-in framers:
//!
//! | Name   | Type                | Layout                                                      |
//! |--------|---------------------|-------------------------------------------------------------|
//! | `lv`   | [`LengthValue`]     | `u32` big-endian body length, body                          |
//! | `tlv`  | [`TypeLengthValue`] | `u32` little-endian length of id + body, `u32` LE id, body  |
//! | `line` | [`Line`]            | body, `\r\n`                                                |

use std::{fmt, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

mod coders;
mod framers;
mod registry;

#[cfg(feature = "msgpack")]
pub use coders::MsgPackCoder;
pub use coders::{BytesCoder, JsonCoder, Utf8Coder};
pub use framers::{LengthValue, Line, TypeLengthValue, DEFAULT_MAX_FRAME};
pub use registry::MessageRegistry;

/// Serializes messages of type `M` to bytes and back.
pub trait Coder<M>: Send + Sync + 'static {
    /// The coder name, as registered in the plugin registry.
    fn name(&self) -> &'static str;

    /// Encodes a message into a frame body.
    fn encode(&self, msg: &M) -> Result<Bytes, CodecError>;

    /// Decodes a frame body into a message.
    fn decode(&self, bytes: &[u8]) -> Result<M, CodecError>;
}

/// Splits a byte stream into frames and joins frames back into a stream.
pub trait Framer<M>: Send + Sync + 'static {
    /// The framer name, as registered in the plugin registry.
    fn name(&self) -> &'static str;

    /// Decodes the next complete frame from `src`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a whole frame.
    fn decode_frame(&self, src: &mut BytesMut, coder: &dyn Coder<M>)
        -> Result<Option<M>, CodecError>;

    /// Appends the frame for `msg` to `dst`.
    fn encode_frame(
        &self,
        msg: &M,
        coder: &dyn Coder<M>,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError>;
}

/// A message that carries a numeric type id on the wire.
///
/// Implement it with `#[derive(TypedMessage)]`, which also generates a `register_messages`
/// function for populating a [`MessageRegistry`].
pub trait TypedMessage {
    /// The id written in front of the message body.
    fn message_id(&self) -> u32;
}

/// A [`Decoder`] and [`Encoder`] built from a framer and a coder.
pub struct FrameCodec<M> {
    framer: Arc<dyn Framer<M>>,
    coder: Arc<dyn Coder<M>>,
}

impl<M> FrameCodec<M>
where
    M: 'static,
{
    /// Creates a codec from a shared framer and coder.
    pub fn new(framer: Arc<dyn Framer<M>>, coder: Arc<dyn Coder<M>>) -> Self {
        FrameCodec { framer, coder }
    }
}

impl<M> Clone for FrameCodec<M> {
    fn clone(&self) -> Self {
        FrameCodec {
            framer: self.framer.clone(),
            coder: self.coder.clone(),
        }
    }
}

impl<M> fmt::Debug for FrameCodec<M>
where
    M: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("framer", &self.framer.name())
            .field("coder", &self.coder.name())
            .finish()
    }
}

impl<M> Decoder for FrameCodec<M>
where
    M: 'static,
{
    type Item = M;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>, CodecError> {
        self.framer.decode_frame(src, &*self.coder)
    }
}

impl<M> Encoder<M> for FrameCodec<M>
where
    M: 'static,
{
    type Error = CodecError;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.framer.encode_frame(&item, &*self.coder, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use serde::{Deserialize, Serialize};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Chat {
        from: String,
        text: String,
    }

    #[tokio::test]
    async fn frames_survive_arbitrary_chunking() -> Result<(), Box<dyn std::error::Error>> {
        let codec = FrameCodec::<Chat>::new(Arc::new(LengthValue::default()), Arc::new(JsonCoder));
        let (client, server) = tokio::io::duplex(7);

        let messages: Vec<_> = (0..20)
            .map(|i| Chat {
                from: format!("user{i}"),
                text: "x".repeat(i * 13),
            })
            .collect();

        let writer = {
            let codec = codec.clone();
            let messages = messages.clone();
            tokio::spawn(async move {
                let mut framed = FramedWrite::new(client, codec);
                for msg in messages {
                    framed.send(msg).await?;
                }
                Ok::<_, CodecError>(())
            })
        };

        let received: Vec<Chat> = FramedRead::new(server, codec)
            .take(messages.len())
            .map(|res| res.expect("decode"))
            .collect()
            .await;
        writer.await??;

        assert_eq!(received, messages);

        Ok(())
    }
}
