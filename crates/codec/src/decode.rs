use bytes::{Buf, BytesMut};

use crate::RespValue;

/// Outcome of one decode attempt over the connection's receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// The buffer does not yet hold a complete request; `0` is a hint of how
    /// many further bytes are needed at minimum. Aside from leading-noise
    /// trimming, the buffer is left untouched so the next call can restart
    /// from the request's `*`.
    NeedMore(usize),
    /// One complete value. The bytes it occupied have been consumed.
    ///
    /// Protocol errors are reported as `Value(RespValue::Error(..))` with the
    /// offending prefix consumed through its terminating `\r\n`, so the
    /// dispatcher can forward them to the client and the connection stays
    /// usable.
    Value(RespValue),
}

// '\r\n'
const MIN_NEEDED: usize = 2;

const INVALID_ARRAY_LENGTH: &str = "Protocol Error: Invalid Array length";
const INVALID_BULK_LENGTH: &str = "Protocol Error: Invalid Bulk String length";
const EXPECT_CRLF: &str = "Protocol Error: Expect '\\r\\n'";

enum Length {
    Valid(i64),
    NeedMore(usize),
    Invalid,
}

/// Decode one RESP request from `buf`.
///
/// Only the array-of-bulk-strings request shape is accepted: clients send
/// commands, and a command is always `*<n>` of `$<len>` elements. Null
/// arrays (`*-1`) and empty arrays are rejected as protocol errors, as are
/// null and empty bulk strings.
///
/// Decoding is resumable at any byte boundary: a partial request yields
/// `NeedMore` and the same bytes are re-examined once the caller has
/// appended more.
pub fn decode(buf: &mut BytesMut) -> Decoded {
    if buf.len() < MIN_NEEDED {
        return Decoded::NeedMore(MIN_NEEDED - buf.len());
    }

    // Leading '\r\n' pairs are keepalive noise from some clients; they never
    // carry protocol meaning ahead of the array header.
    skip_noise(buf);
    if buf.is_empty() {
        return Decoded::NeedMore(MIN_NEEDED);
    }

    let input: &[u8] = &buf[..];
    let mut pos = 0usize;

    let array_len = match read_length(b'*', input, &mut pos) {
        Length::Invalid => {
            // The offending bytes up through the bad field are abandoned.
            buf.advance(pos);
            return Decoded::Value(RespValue::Error(INVALID_ARRAY_LENGTH.to_string()));
        }
        Length::NeedMore(needed) => return Decoded::NeedMore(needed),
        Length::Valid(n) => n,
    };

    if array_len <= 0 {
        // -1 would mean a null array and 0 an empty one; neither is a
        // request this server can act on.
        if array_len < -1 {
            tracing::warn!(array_len, "-1 is the only valid negative Array length");
        }
        buf.advance(pos);
        return Decoded::Value(RespValue::Error(INVALID_ARRAY_LENGTH.to_string()));
    }

    let mut elements: Vec<Vec<u8>> = Vec::with_capacity(array_len.min(1024) as usize);
    for _ in 0..array_len {
        let elem_len = match read_length(b'$', input, &mut pos) {
            Length::Invalid => {
                buf.advance(pos);
                return Decoded::Value(RespValue::Error(INVALID_BULK_LENGTH.to_string()));
            }
            Length::NeedMore(needed) => return Decoded::NeedMore(needed),
            Length::Valid(n) => n,
        };

        if elem_len <= 0 {
            if elem_len < -1 {
                tracing::warn!(elem_len, "-1 is the only valid negative Bulk String length");
            }
            buf.advance(pos);
            return Decoded::Value(RespValue::Error(INVALID_BULK_LENGTH.to_string()));
        }
        let elem_len = elem_len as usize;

        let remaining = input.len() - pos;
        if remaining < elem_len + 2 {
            // No trimming: once the payload arrives we restart from '*'.
            return Decoded::NeedMore(elem_len + 2 - remaining);
        }

        elements.push(input[pos..pos + elem_len].to_vec());
        pos += elem_len;

        // The payload must terminate with '\r\n'.
        let first = input[pos];
        pos += 1;
        let terminated = first == b'\r' && {
            let second = input[pos];
            pos += 1;
            second == b'\n'
        };
        if !terminated {
            buf.advance(pos);
            return Decoded::Value(RespValue::Error(EXPECT_CRLF.to_string()));
        }
    }

    buf.advance(pos);
    Decoded::Value(RespValue::BulkArray(elements))
}

/// Read a `<indicator><decimal>\r\n` length field at `pos`, advancing `pos`
/// past every byte examined. On `Invalid` the caller abandons the consumed
/// prefix; on `NeedMore` the caller leaves the buffer as-is.
fn read_length(indicator: u8, input: &[u8], pos: &mut usize) -> Length {
    let remaining = input.len() - *pos;
    if remaining < MIN_NEEDED {
        return Length::NeedMore(MIN_NEEDED - remaining);
    }

    let Some(cr) = memchr::memchr(b'\r', &input[*pos..]) else {
        // Terminator not buffered yet.
        return Length::NeedMore(MIN_NEEDED);
    };
    let field = &input[*pos..*pos + cr];
    *pos += cr + 1;

    if *pos >= input.len() {
        return Length::NeedMore(1); // '\n'
    }
    let lf = input[*pos];
    *pos += 1;
    if lf != b'\n' {
        return Length::Invalid;
    }

    // At least the indicator plus one digit.
    if field.len() < 2 || field[0] != indicator {
        return Length::Invalid;
    }
    match std::str::from_utf8(&field[1..])
        .ok()
        .and_then(|digits| digits.parse::<i64>().ok())
    {
        Some(n) => Length::Valid(n),
        None => Length::Invalid,
    }
}

fn skip_noise(buf: &mut BytesMut) {
    let bytes: &[u8] = &buf[..];
    let mut n = 0;
    // A trailing lone '\r' stays put; it may be the start of the next pair.
    while n + 1 < bytes.len() && bytes[n] == b'\r' && bytes[n + 1] == b'\n' {
        n += 2;
    }
    buf.advance(n);
}
