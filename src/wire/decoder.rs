use std::{error, fmt, io};

use bytes::Buf;
use memchr::memmem;
use tokio_util::codec;

use super::END_TOKEN;

/// A decoder for a stream of end-token-delimited frames.
///
/// Frames have no length prefix: receivers read bytes until the end token is
/// observed and strip it. The decoder remembers how far it has scanned so a
/// large value arriving in many small reads is not rescanned from the start
/// on every poll.
#[derive(Debug, Default)]
pub struct Decoder {
    scanned: usize,
}

impl codec::Decoder for Decoder {
    type Item = bytes::Bytes;

    type Error = Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // Back up far enough to catch a token straddling the previous scan
        // boundary.
        let start = self.scanned.saturating_sub(END_TOKEN.len() - 1);

        match memmem::find(&src[start..], END_TOKEN) {
            Some(idx) => {
                // Panic safety: find guarantees start + idx + token fits in
                // src, so both split_to and advance are in range.
                let frame = src.split_to(start + idx);
                src.advance(END_TOKEN.len());
                self.scanned = 0;

                Ok(Some(frame.freeze()))
            },
            None => {
                self.scanned = src.len();
                Ok(None)
            },
        }
    }
}

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}
