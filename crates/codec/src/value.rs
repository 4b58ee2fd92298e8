use bytes::{BufMut, Bytes, BytesMut};

/// A single RESP protocol value.
///
/// `BulkArray` is the specialization of `Array` holding only bulk strings;
/// it is the only shape the request decoder produces, and distinguishing it
/// at the value level spares every dispatch site a per-element match.
///
/// `Pending` is internal-only: it marks a reply slot whose value will be
/// supplied later by an asynchronous handler, and must never reach the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Int(i64),
    Simple(String),
    Error(String),
    Bulk(Vec<u8>),
    Array(Vec<RespValue>),
    BulkArray(Vec<Vec<u8>>),
    NullBulk,
    Pending,
}

impl RespValue {
    pub fn ok() -> RespValue {
        RespValue::Simple("OK".to_string())
    }

    pub fn go_away() -> RespValue {
        RespValue::Error("GOAWAY".to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RespValue::Pending)
    }

    /// Append the canonical wire encoding of this value to `buf`.
    ///
    /// Panics when called on `Pending`: an unresolved reply reaching the
    /// encoder is an ordering-adapter invariant violation.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::Int(n) => {
                buf.put_u8(b':');
                buf.put_slice(itoa(*n).as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Simple(s) | RespValue::Error(s) => {
                buf.put_u8(if self.is_error() { b'-' } else { b'+' });
                // CR/LF inside the payload would terminate the frame early,
                // so they are escaped to the literal two-byte sequences.
                for b in s.bytes() {
                    match b {
                        b'\r' => buf.put_slice(b"\\r"),
                        b'\n' => buf.put_slice(b"\\n"),
                        b => buf.put_u8(b),
                    }
                }
                buf.put_slice(b"\r\n");
            }
            RespValue::Bulk(data) => encode_bulk(data, buf),
            RespValue::Array(elements) => {
                buf.put_u8(b'*');
                buf.put_slice(itoa(elements.len() as i64).as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    element.encode_into(buf);
                }
            }
            RespValue::BulkArray(elements) => {
                buf.put_u8(b'*');
                buf.put_slice(itoa(elements.len() as i64).as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    encode_bulk(element, buf);
                }
            }
            RespValue::NullBulk => buf.put_slice(b"$-1\r\n"),
            RespValue::Pending => panic!("pending replies cannot be encoded"),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

fn encode_bulk(data: &[u8], buf: &mut BytesMut) {
    buf.put_u8(b'$');
    buf.put_slice(itoa(data.len() as i64).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

fn itoa(n: i64) -> String {
    n.to_string()
}
