//! Length-delimited wire framing.
//!
//! Frame layout, all multi-byte integers big-endian:
//!
//! ```text
//! START(1) | total_len(4) | id_len(4) | msg_id | method_len(4) | method |
//! err_code(4) | err_info_len(4) | err_info | payload | checksum(4) | END(1)
//! ```
//!
//! `total_len` counts every byte from START through END inclusive. The
//! checksum is crc32c over everything between the START marker and the
//! checksum field; the decoder verifies it and flags mismatching frames as
//! parse-failed (still surfaced, so callers can observe partial data).

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error};

use crate::buffer::ByteBuffer;

pub const FRAME_START: u8 = 0x02;
pub const FRAME_END: u8 = 0x03;

/// Length fields above this are treated as false-positive START matches, so
/// a corrupt header cannot stall the decoder while the in-buffer grows
/// without bound.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Two marker bytes plus six 4-byte integer fields
/// (total_len, id_len, method_len, err_code, err_info_len, checksum).
const FRAME_OVERHEAD: usize = 2 + 24;

/// One decoded/encoded protocol frame carrying a request or a response.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Correlation key, unique per in-flight call on a connection.
    pub msg_id: String,
    /// Full method name, `service.method`.
    pub method_name: String,
    pub err_code: i32,
    pub err_info: String,
    pub payload: Bytes,
    pub checksum: u32,
    /// False when a length sub-field or the checksum check failed; such
    /// envelopes are still emitted.
    pub parse_ok: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            msg_id: String::new(),
            method_name: String::new(),
            err_code: 0,
            err_info: String::new(),
            payload: Bytes::new(),
            checksum: 0,
            parse_ok: true,
        }
    }
}

impl Envelope {
    pub fn request(msg_id: String, method_name: String, payload: Bytes) -> Self {
        Self {
            msg_id,
            method_name,
            payload,
            ..Default::default()
        }
    }

    /// Response skeleton echoing the request's correlation id and method.
    pub fn response_to(req: &Envelope) -> Self {
        Self {
            msg_id: req.msg_id.clone(),
            method_name: req.method_name.clone(),
            ..Default::default()
        }
    }
}

/// Stateless encoder/decoder for the frame layout above. Decode tolerates
/// partial frames and payload bytes that happen to equal the START marker.
#[derive(Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Serialize one envelope to bytes.
    pub fn encode_to_bytes(&self, env: &Envelope) -> Bytes {
        let total_len = FRAME_OVERHEAD
            + env.msg_id.len()
            + env.method_name.len()
            + env.err_info.len()
            + env.payload.len();
        let mut out = BytesMut::with_capacity(total_len);
        out.put_u8(FRAME_START);
        out.put_u32(total_len as u32);
        out.put_u32(env.msg_id.len() as u32);
        out.put_slice(env.msg_id.as_bytes());
        out.put_u32(env.method_name.len() as u32);
        out.put_slice(env.method_name.as_bytes());
        out.put_i32(env.err_code);
        out.put_u32(env.err_info.len() as u32);
        out.put_slice(env.err_info.as_bytes());
        out.put_slice(&env.payload);
        let checksum = crc32c::crc32c(&out[1..]);
        out.put_u32(checksum);
        out.put_u8(FRAME_END);
        debug_assert_eq!(out.len(), total_len);
        out.freeze()
    }

    /// Encode one envelope, appending to the connection's out-buffer.
    pub fn encode(&self, env: &Envelope, out: &mut ByteBuffer) {
        out.write_slice(&self.encode_to_bytes(env));
    }

    /// Decode zero or more complete frames from the buffer's unread region,
    /// advancing the read cursor past every frame consumed. Partial trailing
    /// bytes stay buffered for the next readable event; never blocks.
    pub fn decode(&self, buf: &mut ByteBuffer) -> Vec<Envelope> {
        let mut out = Vec::new();
        loop {
            match scan_one(buf.peek()) {
                Some((env, consumed)) => {
                    buf.advance_read(consumed);
                    out.push(env);
                }
                None => break,
            }
        }
        out
    }
}

/// Find and parse the first structurally complete frame in `data`. Returns the
/// envelope and the number of bytes to consume (leading garbage included), or
/// None when no complete frame is present.
fn scan_one(data: &[u8]) -> Option<(Envelope, usize)> {
    let mut i = 0;
    while i < data.len() {
        if data[i] != FRAME_START {
            i += 1;
            continue;
        }
        if i + 5 > data.len() {
            return None; // length field not buffered yet
        }
        let pk_len = u32::from_be_bytes(data[i + 1..i + 5].try_into().unwrap()) as usize;
        if pk_len < FRAME_OVERHEAD || pk_len > MAX_FRAME_LEN {
            // cannot be a real frame header
            i += 1;
            continue;
        }
        let end = i + pk_len - 1;
        if end >= data.len() {
            return None; // incomplete frame, wait for more bytes
        }
        if data[end] != FRAME_END {
            // false-positive START match inside payload bytes
            i += 1;
            continue;
        }
        let env = parse_frame(&data[i..=end], pk_len);
        return Some((env, end + 1));
    }
    None
}

/// Extract the fields of one structurally complete frame. A length sub-field
/// that would push a later offset out of the frame bounds marks the envelope
/// parse-failed but the frame is still consumed and emitted.
fn parse_frame(frame: &[u8], pk_len: usize) -> Envelope {
    let mut env = Envelope::default();
    // checksum sits right before END
    let checksum_at = frame.len() - 5;
    env.checksum = u32::from_be_bytes(frame[checksum_at..checksum_at + 4].try_into().unwrap());

    let mut c = 5usize; // past START + total_len

    let mut read_u32 = |c: &mut usize| -> Option<u32> {
        if *c + 4 > checksum_at {
            return None;
        }
        let v = u32::from_be_bytes(frame[*c..*c + 4].try_into().unwrap());
        *c += 4;
        Some(v)
    };
    let read_str = |c: &mut usize, len: usize| -> Option<String> {
        if *c + len > checksum_at {
            return None;
        }
        let s = String::from_utf8_lossy(&frame[*c..*c + len]).into_owned();
        *c += len;
        Some(s)
    };

    let parsed = (|| -> Option<()> {
        let id_len = read_u32(&mut c)? as usize;
        env.msg_id = read_str(&mut c, id_len)?;
        let method_len = read_u32(&mut c)? as usize;
        env.method_name = read_str(&mut c, method_len)?;
        env.err_code = read_u32(&mut c)? as i32;
        let err_info_len = read_u32(&mut c)? as usize;
        env.err_info = read_str(&mut c, err_info_len)?;
        let payload_len = pk_len
            .checked_sub(FRAME_OVERHEAD + id_len + method_len + err_info_len)?;
        if c + payload_len != checksum_at {
            return None;
        }
        env.payload = Bytes::copy_from_slice(&frame[c..c + payload_len]);
        Some(())
    })()
    .is_some();

    if !parsed {
        error!(
            "frame field lengths exceed frame bounds, pk_len={}, flagging parse failure",
            pk_len
        );
        env.parse_ok = false;
        return env;
    }

    let computed = crc32c::crc32c(&frame[1..checksum_at]);
    if computed != env.checksum {
        error!(
            msg_id = %env.msg_id,
            "frame checksum mismatch: wire={:#010x} computed={:#010x}",
            env.checksum, computed
        );
        env.parse_ok = false;
    } else {
        debug!(msg_id = %env.msg_id, method = %env.method_name, "decoded frame, len={}", pk_len);
    }
    env
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(id: &str, payload: &[u8]) -> Envelope {
        Envelope::request(
            id.to_owned(),
            "Order.makeOrder".to_owned(),
            Bytes::copy_from_slice(payload),
        )
    }

    #[test]
    fn test_round_trip() {
        let codec = FrameCodec;
        let mut env = sample("42", b"price=100;goods=apple");
        env.err_code = -1;
        env.err_info = "short balance".to_owned();

        let mut buf = ByteBuffer::with_capacity(64);
        codec.encode(&env, &mut buf);
        let got = codec.decode(&mut buf);
        assert_eq!(got.len(), 1);
        let got = &got[0];
        assert!(got.parse_ok);
        assert_eq!(got.msg_id, "42");
        assert_eq!(got.method_name, "Order.makeOrder");
        assert_eq!(got.err_code, -1);
        assert_eq!(got.err_info, "short balance");
        assert_eq!(&got.payload[..], b"price=100;goods=apple");
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn test_two_back_to_back_frames() {
        let codec = FrameCodec;
        let mut buf = ByteBuffer::with_capacity(64);
        codec.encode(&sample("1", b"first"), &mut buf);
        codec.encode(&sample("2", b"second"), &mut buf);
        let got = codec.decode(&mut buf);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].msg_id, "1");
        assert_eq!(got[1].msg_id, "2");
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn test_truncated_trailing_frame_left_unconsumed() {
        let codec = FrameCodec;
        let mut buf = ByteBuffer::with_capacity(64);
        codec.encode(&sample("1", b"whole"), &mut buf);
        let second = codec.encode_to_bytes(&sample("2", b"truncated"));
        let cut = second.len() - 7;
        buf.write_slice(&second[..cut]);

        let got = codec.decode(&mut buf);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg_id, "1");
        assert_eq!(buf.readable(), cut);

        // remainder arrives, decode resumes
        buf.write_slice(&second[cut..]);
        let got = codec.decode(&mut buf);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg_id, "2");
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn test_payload_containing_start_marker() {
        let codec = FrameCodec;
        let mut buf = ByteBuffer::with_capacity(64);
        // garbage that includes a bare START byte before the real frame
        buf.write_slice(&[0x00, FRAME_START, 0x09]);
        let payload = [FRAME_START, FRAME_END, FRAME_START, 7, 8];
        codec.encode(&sample("7", &payload), &mut buf);
        let got = codec.decode(&mut buf);
        assert_eq!(got.len(), 1);
        assert!(got[0].parse_ok);
        assert_eq!(&got[0].payload[..], &payload);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn test_checksum_mismatch_flagged_not_dropped() {
        let codec = FrameCodec;
        let bytes = codec.encode_to_bytes(&sample("9", b"data"));
        let mut corrupted = bytes.to_vec();
        let n = corrupted.len();
        corrupted[n - 6] ^= 0xff; // flip a checksum byte
        let mut buf = ByteBuffer::with_capacity(64);
        buf.write_slice(&corrupted);
        let got = codec.decode(&mut buf);
        assert_eq!(got.len(), 1);
        assert!(!got[0].parse_ok);
        assert_eq!(got[0].msg_id, "9");
    }

    #[test]
    fn test_oversized_length_field_treated_as_garbage() {
        let codec = FrameCodec;
        let mut buf = ByteBuffer::with_capacity(64);
        // START followed by a corrupt 4 GiB length, then a real frame
        let mut junk = vec![FRAME_START];
        junk.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.write_slice(&junk);
        codec.encode(&sample("3", b"ok"), &mut buf);
        let got = codec.decode(&mut buf);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg_id, "3");
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn test_empty_fields() {
        let codec = FrameCodec;
        let mut buf = ByteBuffer::with_capacity(64);
        codec.encode(&Envelope::default(), &mut buf);
        let got = codec.decode(&mut buf);
        assert_eq!(got.len(), 1);
        assert!(got[0].parse_ok);
        assert!(got[0].msg_id.is_empty());
        assert!(got[0].payload.is_empty());
    }
}
