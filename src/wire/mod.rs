use bytes::{BufMut, Bytes, BytesMut};
use memchr::memmem;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Framed};

pub mod decoder;
pub mod encoder;

/// Terminates every message on the wire. Payloads containing this sequence
/// are not supported; callers avoid it via content encoding.
pub const END_TOKEN: &[u8] = b"[-_-]";

/// Separates the fields of a request frame.
pub const SPLIT_TOKEN: &[u8] = b"[*BUCKET_SPLIT_TOKEN*]";

/// Frame sent in place of a value that does not exist.
pub const NULL_FRAME: &[u8] = b"__null__";

/// Acknowledgment frame.
pub const OK_FRAME: &[u8] = b"ok";

/// Prefix announcing a large value of the stated byte length.
pub const BIG_PREFIX: &[u8] = b"__big__";

pub fn framed<T: AsyncRead + AsyncWrite>(stream: T) -> Framed<T, Codec> {
    Framed::new(stream, Default::default())
}

/// Joins request fields with the split token into a single frame payload.
pub fn join_fields(fields: &[&[u8]]) -> Bytes {
    let total: usize = fields.iter().map(|f| f.len()).sum::<usize>()
        + SPLIT_TOKEN.len() * fields.len().saturating_sub(1);
    let mut out = BytesMut::with_capacity(total);
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.put_slice(SPLIT_TOKEN);
        }
        out.put_slice(field);
    }
    out.freeze()
}

/// Splits a frame into exactly `n` fields on the split token. The last field
/// receives any remaining bytes, so a trailing binary payload survives even
/// if it happens to contain the token. Returns `None` on too few fields.
pub fn split_fields(frame: &Bytes, n: usize) -> Option<Vec<Bytes>> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = frame.clone();
    for _ in 0..n - 1 {
        let idx = memmem::find(&rest, SPLIT_TOKEN)?;
        fields.push(rest.slice(..idx));
        rest = rest.slice(idx + SPLIT_TOKEN.len()..);
    }
    fields.push(rest);
    Some(fields)
}

#[derive(Default)]
pub struct Codec {
    d: decoder::Decoder,
    e: encoder::Encoder,
}

impl codec::Decoder for Codec {
    type Item = Bytes;

    type Error = decoder::Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        self.d.decode(src)
    }
}

impl codec::Encoder<Bytes> for Codec {
    type Error = decoder::Error;

    fn encode(
        &mut self,
        item: Bytes,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        self.e.encode(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_split() {
        let frame = join_fields(&[b"key-1", b"set", b"300", b"payload"]);
        let fields = split_fields(&frame, 4).unwrap();
        assert_eq!(fields[0].as_ref(), b"key-1");
        assert_eq!(fields[1].as_ref(), b"set");
        assert_eq!(fields[2].as_ref(), b"300");
        assert_eq!(fields[3].as_ref(), b"payload");
    }

    #[test]
    fn test_split_keeps_token_in_trailing_payload() {
        let mut payload = b"prefix".to_vec();
        payload.extend_from_slice(SPLIT_TOKEN);
        payload.extend_from_slice(b"suffix");

        let frame = join_fields(&[b"k", b"set", b"300", &payload]);
        let fields = split_fields(&frame, 4).unwrap();
        assert_eq!(fields[3].as_ref(), payload.as_slice());
    }

    #[test]
    fn test_split_too_few_fields() {
        let frame = join_fields(&[b"k", b"get"]);
        assert!(split_fields(&frame, 4).is_none());
    }
}
