mod decode;
mod value;

pub use decode::{decode, Decoded};
pub use value::RespValue;

/// Key tagged onto unsolicited frames (monitor broadcasts, GOAWAY).
/// They bypass reply ordering entirely.
pub const UNSOLICITED_KEY: i64 = -1;

/// A RESP value tagged with the sequence key of the request it answers.
///
/// Keys are assigned in request-arrival order by the reply-ordering adapter,
/// and responses are released strictly in key order. [`UNSOLICITED_KEY`]
/// marks frames which do not answer any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub key: i64,
    pub value: RespValue,
}

impl Frame {
    pub fn new(key: i64, value: RespValue) -> Self {
        Self { key, value }
    }

    pub fn unsolicited(value: RespValue) -> Self {
        Self {
            key: UNSOLICITED_KEY,
            value,
        }
    }
}
