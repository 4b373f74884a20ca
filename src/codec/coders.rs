use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::CodecError;

use super::Coder;

/// Encodes messages as JSON with `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCoder;

impl<M> Coder<M> for JsonCoder
where
    M: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, msg: &M) -> Result<Bytes, CodecError> {
        serde_json::to_vec(msg)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode(Box::new(err)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<M, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(Box::new(err)))
    }
}

/// Encodes messages as MessagePack with `rmp-serde`, using named struct fields.
#[cfg(feature = "msgpack")]
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackCoder;

#[cfg(feature = "msgpack")]
impl<M> Coder<M> for MsgPackCoder
where
    M: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, msg: &M) -> Result<Bytes, CodecError> {
        rmp_serde::to_vec_named(msg)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode(Box::new(err)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<M, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|err| CodecError::Decode(Box::new(err)))
    }
}

/// Passes raw bytes through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCoder;

impl Coder<Bytes> for BytesCoder {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, msg: &Bytes) -> Result<Bytes, CodecError> {
        Ok(msg.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Treats frame bodies as UTF-8 text.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Coder;

impl Coder<String> for Utf8Coder {
    fn name(&self) -> &'static str {
        "utf8"
    }

    fn encode(&self, msg: &String) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(msg.as_bytes()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|err| CodecError::Decode(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Login {
        user: String,
        attempt: u8,
    }

    #[test]
    fn json_rejects_garbage() {
        let res: Result<Login, _> = JsonCoder.decode(b"{\"user\":");
        assert!(matches!(res, Err(CodecError::Decode(_))));
    }

    #[cfg(feature = "msgpack")]
    #[test]
    fn msgpack_is_more_compact_than_json() -> Result<(), Box<dyn std::error::Error>> {
        let msg = Login {
            user: "ferris".to_string(),
            attempt: 3,
        };
        let packed = Coder::<Login>::encode(&MsgPackCoder, &msg)?;
        let json = Coder::<Login>::encode(&JsonCoder, &msg)?;
        assert!(packed.len() < json.len());
        assert_eq!(Coder::<Login>::decode(&MsgPackCoder, &packed)?, msg);

        Ok(())
    }

    #[test]
    fn utf8_rejects_invalid_text() {
        assert!(Utf8Coder.decode(&[0xff, 0xfe]).is_err());
        assert_eq!(Utf8Coder.decode(b"hi").ok().as_deref(), Some("hi"));
    }
}
