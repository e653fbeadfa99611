//! Built-in framers.
//!
//! - `LengthDelimited`: 4-byte big-endian length prefix, then payload
//! - `LineDelimited`: `\n`-terminated lines, trailing `\r` stripped
//!
//! `CodecHandler` pairs a codec with a closure so simple servers need no
//! `Handler` impl of their own. It closes the connection after the closure
//! sees an error the codec cannot resynchronise from.

use std::sync::Arc;

use shardnet_core::{DecodeError, Frame};
use shardnet_runtime::{Conn, Handler};

/// Byte-stream framer usable from `Handler::read`
pub trait Codec: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    /// Frame at most one item from `input` appended to `leftover`.
    fn decode(&self, input: &[u8], leftover: Vec<u8>) -> Frame<Self::Item>;

    /// Append the wire form of `payload` to `out`.
    fn encode(&self, payload: &[u8], out: &mut Vec<u8>);

    /// Whether the stream is unusable after `err`.
    fn is_fatal(&self, _err: &DecodeError) -> bool {
        false
    }
}

pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

/// 4-byte big-endian length prefix.
///
/// An oversized length leaves the rest of that body in flight with no way
/// to find the next header, so `TooLong` is fatal for the connection.
#[derive(Debug, Clone, Copy)]
pub struct LengthDelimited {
    max_frame: usize,
}

impl Default for LengthDelimited {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl LengthDelimited {
    const HEADER: usize = 4;

    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Codec for LengthDelimited {
    type Item = Vec<u8>;

    fn decode(&self, input: &[u8], mut buf: Vec<u8>) -> Frame<Vec<u8>> {
        buf.extend_from_slice(input);
        if buf.len() < Self::HEADER {
            return Frame::incomplete(buf);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_frame {
            // No way to find the next header: drop what is buffered
            return Frame::error(
                DecodeError::TooLong {
                    len,
                    max: self.max_frame,
                },
                Vec::new(),
            );
        }
        if buf.len() < Self::HEADER + len {
            return Frame::incomplete(buf);
        }
        let rest = buf.split_off(Self::HEADER + len);
        buf.drain(..Self::HEADER);
        Frame::packet(buf, rest)
    }

    fn encode(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.reserve(Self::HEADER + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
    }

    fn is_fatal(&self, err: &DecodeError) -> bool {
        matches!(err, DecodeError::TooLong { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LineDelimited {
    max_line: usize,
}

impl Default for LineDelimited {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl LineDelimited {
    pub fn new(max_line: usize) -> Self {
        Self { max_line }
    }
}

impl Codec for LineDelimited {
    type Item = Vec<u8>;

    fn decode(&self, input: &[u8], mut buf: Vec<u8>) -> Frame<Vec<u8>> {
        buf.extend_from_slice(input);
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                let rest = buf.split_off(i + 1);
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                if buf.len() > self.max_line {
                    let len = buf.len();
                    return Frame::error(DecodeError::TooLong { len, max: self.max_line }, rest);
                }
                Frame::packet(buf, rest)
            }
            None if buf.len() > self.max_line => {
                let len = buf.len();
                Frame::error(DecodeError::TooLong { len, max: self.max_line }, Vec::new())
            }
            None => Frame::incomplete(buf),
        }
    }

    fn encode(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.reserve(payload.len() + 1);
        out.extend_from_slice(payload);
        out.push(b'\n');
    }
}

/// `Handler` built from a codec and a handle closure
pub struct CodecHandler<C, F> {
    codec: C,
    handle: F,
}

impl<C, F> CodecHandler<C, F>
where
    C: Codec,
    F: Fn(&C, &Arc<Conn>, Option<C::Item>, Option<DecodeError>) + Send + Sync + 'static,
{
    pub fn new(codec: C, handle: F) -> Self {
        Self { codec, handle }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

impl<C, F> Handler for CodecHandler<C, F>
where
    C: Codec,
    F: Fn(&C, &Arc<Conn>, Option<C::Item>, Option<DecodeError>) + Send + Sync + 'static,
{
    type Packet = C::Item;

    fn read(&self, input: &[u8], leftover: Vec<u8>) -> Frame<C::Item> {
        self.codec.decode(input, leftover)
    }

    fn handle(&self, conn: &Arc<Conn>, packet: Option<C::Item>, error: Option<DecodeError>) {
        let fatal = error.as_ref().map_or(false, |e| self.codec.is_fatal(e));
        (self.handle)(&self.codec, conn, packet, error);
        if fatal {
            let _ = conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed chunks the way a framing worker does; returns items, errors
    /// and the final leftover.
    fn drive<C: Codec>(codec: &C, chunks: &[&[u8]]) -> (Vec<C::Item>, Vec<DecodeError>, Vec<u8>) {
        let mut items = Vec::new();
        let mut errors = Vec::new();
        let mut leftover = Vec::new();
        for chunk in chunks {
            let mut input: &[u8] = chunk;
            loop {
                let frame = codec.decode(input, std::mem::take(&mut leftover));
                input = &[];
                leftover = frame.leftover;
                if frame.ready {
                    items.extend(frame.packet);
                    errors.extend(frame.error);
                }
                if frame.finished || !frame.ready {
                    break;
                }
            }
        }
        (items, errors, leftover)
    }

    /// Split `wire` at a spread of boundaries, including 1-byte chunks.
    fn splits(wire: &[u8]) -> Vec<Vec<&[u8]>> {
        let mut out = vec![vec![wire], wire.chunks(1).collect(), wire.chunks(7).collect()];
        let mut uneven = Vec::new();
        let (mut at, mut step) = (0, 3);
        while at < wire.len() {
            let end = (at + step).min(wire.len());
            uneven.push(&wire[at..end]);
            at = end;
            step = step * 5 % 17 + 1;
        }
        out.push(uneven);
        out
    }

    #[test]
    fn test_length_delimited_split_anywhere() {
        let codec = LengthDelimited::default();
        let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; i as usize * 3]).collect();
        let mut wire = Vec::new();
        for p in &payloads {
            codec.encode(p, &mut wire);
        }
        for chunks in splits(&wire) {
            let (items, errors, leftover) = drive(&codec, &chunks);
            assert_eq!(items, payloads);
            assert!(errors.is_empty());
            assert!(leftover.is_empty());
        }
    }

    #[test]
    fn test_length_delimited_too_long() {
        let codec = LengthDelimited::new(4);
        let mut wire = Vec::new();
        codec.encode(b"toolong", &mut wire);
        let frame = codec.decode(&wire, Vec::new());
        assert!(frame.ready && frame.finished);
        assert_eq!(frame.error, Some(DecodeError::TooLong { len: 7, max: 4 }));
    }

    #[test]
    fn test_fatal_errors() {
        let too_long = DecodeError::TooLong { len: 9, max: 4 };
        assert!(LengthDelimited::default().is_fatal(&too_long));
        assert!(!LineDelimited::default().is_fatal(&too_long));
    }

    #[test]
    fn test_line_delimited_split_anywhere() {
        let codec = LineDelimited::default();
        let wire = b"alpha\r\nbeta\n\ngamma delta\n".to_vec();
        for chunks in splits(&wire) {
            let (items, _, leftover) = drive(&codec, &chunks);
            assert_eq!(
                items,
                vec![b"alpha".to_vec(), b"beta".to_vec(), Vec::new(), b"gamma delta".to_vec()]
            );
            assert!(leftover.is_empty());
        }
    }

    #[test]
    fn test_line_partial_keeps_leftover() {
        let codec = LineDelimited::default();
        let (items, _, leftover) = drive(&codec, &[b"one\ntw"]);
        assert_eq!(items, vec![b"one".to_vec()]);
        assert_eq!(leftover, b"tw");
    }

    #[test]
    fn test_line_too_long_resyncs() {
        let codec = LineDelimited::new(3);
        let (items, errors, leftover) = drive(&codec, &[b"abcdef\nok\n"]);
        assert_eq!(errors, vec![DecodeError::TooLong { len: 6, max: 3 }]);
        assert_eq!(items, vec![b"ok".to_vec()]);
        assert!(leftover.is_empty());
    }
}
