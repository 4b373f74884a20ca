use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

use super::{Coder, Framer, MessageRegistry, TypedMessage};

/// Largest frame body accepted by the built-in framers, 8 MiB.
pub const DEFAULT_MAX_FRAME: usize = 1 << 23;

const LV_HEADER: usize = 4;
const TLV_HEADER: usize = 8;
const TLV_ID: usize = 4;

fn check_len(len: usize, max: usize) -> Result<(), CodecError> {
    if len > max {
        return Err(CodecError::FrameTooLarge { len, max });
    }
    Ok(())
}

/// Prefixes each body with its length as a big-endian `u32`.
#[derive(Clone, Copy, Debug)]
pub struct LengthValue {
    max_frame: usize,
}

impl LengthValue {
    /// Creates a framer accepting bodies up to `max_frame` bytes.
    pub fn new(max_frame: usize) -> Self {
        LengthValue { max_frame }
    }
}

impl Default for LengthValue {
    fn default() -> Self {
        LengthValue::new(DEFAULT_MAX_FRAME)
    }
}

impl<M> Framer<M> for LengthValue
where
    M: 'static,
{
    fn name(&self) -> &'static str {
        "lv"
    }

    fn decode_frame(
        &self,
        src: &mut BytesMut,
        coder: &dyn Coder<M>,
    ) -> Result<Option<M>, CodecError> {
        if src.len() < LV_HEADER {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        check_len(len, self.max_frame)?;
        if src.len() < LV_HEADER + len {
            src.reserve(LV_HEADER + len - src.len());
            return Ok(None);
        }

        src.advance(LV_HEADER);
        let body = src.split_to(len);
        coder.decode(&body).map(Some)
    }

    fn encode_frame(
        &self,
        msg: &M,
        coder: &dyn Coder<M>,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let body = coder.encode(msg)?;
        check_len(body.len(), self.max_frame)?;
        dst.reserve(LV_HEADER + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Writes a little-endian length and message id in front of each body.
///
/// The length counts the id and the body. Incoming bodies are decoded by the coder registered for
/// their id in the [`MessageRegistry`], so one connection can carry many message types. Outgoing
/// messages use the registry's encoder for their id when one exists, and the connection's coder
/// otherwise.
pub struct TypeLengthValue<M> {
    registry: Arc<MessageRegistry<M>>,
    max_frame: usize,
}

impl<M> TypeLengthValue<M> {
    /// Creates a framer that resolves ids through `registry`.
    pub fn new(registry: Arc<MessageRegistry<M>>) -> Self {
        Self::with_max_frame(registry, DEFAULT_MAX_FRAME)
    }

    /// Creates a framer with a custom frame size limit.
    pub fn with_max_frame(registry: Arc<MessageRegistry<M>>, max_frame: usize) -> Self {
        TypeLengthValue {
            registry,
            max_frame,
        }
    }
}

impl<M> std::fmt::Debug for TypeLengthValue<M>
where
    M: 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeLengthValue")
            .field("messages", &self.registry.len())
            .field("max_frame", &self.max_frame)
            .finish()
    }
}

impl<M> Framer<M> for TypeLengthValue<M>
where
    M: TypedMessage + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "tlv"
    }

    fn decode_frame(
        &self,
        src: &mut BytesMut,
        _coder: &dyn Coder<M>,
    ) -> Result<Option<M>, CodecError> {
        if src.len() < TLV_HEADER {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < TLV_ID {
            return Err(CodecError::Malformed(
                format!("tlv length {len} shorter than the message id").into(),
            ));
        }
        check_len(len, self.max_frame)?;
        if src.len() < LV_HEADER + len {
            src.reserve(LV_HEADER + len - src.len());
            return Ok(None);
        }

        src.advance(LV_HEADER);
        let id = src.get_u32_le();
        let body = src.split_to(len - TLV_ID);
        self.registry.decode(id, &body).map(Some)
    }

    fn encode_frame(
        &self,
        msg: &M,
        coder: &dyn Coder<M>,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let id = msg.message_id();
        let body = match self.registry.encode(id, msg) {
            Some(res) => res?,
            None => coder.encode(msg)?,
        };
        let len = body.len() + TLV_ID;
        check_len(len, self.max_frame)?;
        dst.reserve(LV_HEADER + len);
        dst.put_u32_le(len as u32);
        dst.put_u32_le(id);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Terminates each body with `\r\n`.
///
/// A line ending in a bare `\n` is rejected, as is a body that itself contains `\n`.
#[derive(Clone, Copy, Debug)]
pub struct Line {
    max_line: usize,
}

impl Line {
    /// Creates a framer accepting lines up to `max_line` bytes, terminator excluded.
    pub fn new(max_line: usize) -> Self {
        Line { max_line }
    }
}

impl Default for Line {
    fn default() -> Self {
        Line::new(DEFAULT_MAX_FRAME)
    }
}

impl<M> Framer<M> for Line
where
    M: 'static,
{
    fn name(&self) -> &'static str {
        "line"
    }

    fn decode_frame(
        &self,
        src: &mut BytesMut,
        coder: &dyn Coder<M>,
    ) -> Result<Option<M>, CodecError> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            check_len(src.len(), self.max_line + 1)?;
            return Ok(None);
        };
        if newline == 0 || src[newline - 1] != b'\r' {
            return Err(CodecError::Malformed("line not terminated by \\r\\n".into()));
        }
        check_len(newline - 1, self.max_line)?;

        let line = src.split_to(newline + 1);
        coder.decode(&line[..newline - 1]).map(Some)
    }

    fn encode_frame(
        &self,
        msg: &M,
        coder: &dyn Coder<M>,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let body = coder.encode(msg)?;
        if body.contains(&b'\n') {
            return Err(CodecError::Malformed("line body contains '\\n'".into()));
        }
        check_len(body.len(), self.max_line)?;
        dst.reserve(body.len() + 2);
        dst.extend_from_slice(&body);
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::codec::{BytesCoder, Utf8Coder};

    use super::*;

    #[test]
    fn lv_waits_for_whole_frame() -> Result<(), Box<dyn std::error::Error>> {
        let framer = LengthValue::default();
        let mut src = BytesMut::from(&[0, 0, 0, 5, b'h', b'e'][..]);
        assert!(Framer::<Bytes>::decode_frame(&framer, &mut src, &BytesCoder)?.is_none());

        src.extend_from_slice(b"llo");
        let frame = Framer::<Bytes>::decode_frame(&framer, &mut src, &BytesCoder)?;
        assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
        assert!(src.is_empty());

        Ok(())
    }

    #[test]
    fn lv_header_is_big_endian() -> Result<(), Box<dyn std::error::Error>> {
        let mut dst = BytesMut::new();
        Framer::<Bytes>::encode_frame(
            &LengthValue::default(),
            &Bytes::from_static(b"abc"),
            &BytesCoder,
            &mut dst,
        )?;
        assert_eq!(&dst[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        Ok(())
    }

    #[test]
    fn lv_rejects_oversized_frame_before_buffering() {
        let framer = LengthValue::new(16);
        let mut src = BytesMut::from(&[0, 0, 1, 0][..]);
        let err = Framer::<Bytes>::decode_frame(&framer, &mut src, &BytesCoder).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { len: 256, max: 16 }));
    }

    #[test]
    fn line_splits_on_crlf() -> Result<(), Box<dyn std::error::Error>> {
        let framer = Line::default();
        let mut src = BytesMut::from("PING\r\nPONG\r\npartial");
        let first = Framer::<String>::decode_frame(&framer, &mut src, &Utf8Coder)?;
        let second = Framer::<String>::decode_frame(&framer, &mut src, &Utf8Coder)?;
        let third = Framer::<String>::decode_frame(&framer, &mut src, &Utf8Coder)?;
        assert_eq!(first.as_deref(), Some("PING"));
        assert_eq!(second.as_deref(), Some("PONG"));
        assert_eq!(third, None);
        assert_eq!(&src[..], b"partial");

        Ok(())
    }

    #[test]
    fn line_rejects_bare_newline() {
        let mut src = BytesMut::from("PING\n");
        let err = Framer::<String>::decode_frame(&Line::default(), &mut src, &Utf8Coder).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn line_rejects_runaway_line() {
        let mut src = BytesMut::from("0123456789");
        let err = Framer::<String>::decode_frame(&Line::new(4), &mut src, &Utf8Coder).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }
}
