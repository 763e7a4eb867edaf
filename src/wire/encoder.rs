use bytes::{BufMut, Bytes};
use tokio_util::codec;

use super::decoder::Error;
use super::END_TOKEN;

/// An encoder appending the end token to each outgoing frame.
#[derive(Debug, Default)]
pub struct Encoder {}

impl codec::Encoder<Bytes> for Encoder {
    type Error = Error;

    fn encode(
        &mut self,
        item: Bytes,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        dst.reserve(item.len() + END_TOKEN.len());

        dst.put_slice(&item);
        dst.put_slice(END_TOKEN);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::Encoder as _;

    #[test]
    fn test_encode() {
        let mut encoder: Encoder = Default::default();
        let mut dst = BytesMut::new();

        encoder.encode(Bytes::from_static(b"abc"), &mut dst).unwrap();
        encoder.encode(Bytes::from_static(b""), &mut dst).unwrap();

        assert_eq!(dst.as_ref(), b"abc[-_-][-_-]");
    }
}
