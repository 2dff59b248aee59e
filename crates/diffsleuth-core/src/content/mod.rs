//! Content inspection -- digests and type signatures for file streams.
//!
//! The digest and type functions are pluggable ([`Digester`],
//! [`TypeIdentifier`]); [`inspect_stream`] drives both over a single read of
//! the stream and aborts promptly when the owning unit is cancelled.
pub mod digest;
pub mod identify;

pub use digest::{sha256, Digest, Digester, Sha256Digester};
pub use identify::{MagicIdentifier, TypeIdentifier, IDENTIFY_HEAD_SIZE};

use crate::pool::CancelToken;
use std::io::{self, Cursor, Read};

/// Result of reading one file: its digest and optional type description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub digest: Digest,
    pub type_signature: Option<String>,
}

/// Digest `reader` (and identify its head when an identifier is given).
///
/// The stream is read once: the head is buffered for the identifier and then
/// chained back in front of the remaining bytes for the digester.
pub fn inspect_stream(
    reader: impl Read,
    digester: &dyn Digester,
    identifier: Option<&dyn TypeIdentifier>,
    cancel: &CancelToken,
) -> io::Result<Inspection> {
    let mut reader = CancellableReader::new(reader, cancel);

    let mut head = Vec::with_capacity(IDENTIFY_HEAD_SIZE);
    if identifier.is_some() {
        (&mut reader)
            .take(IDENTIFY_HEAD_SIZE as u64)
            .read_to_end(&mut head)?;
    }
    let type_signature = identifier.and_then(|id| id.identify(&head));

    let mut chained = Cursor::new(head).chain(reader);
    let digest = digester.digest(&mut chained)?;

    Ok(Inspection {
        digest,
        type_signature,
    })
}

/// Reader wrapper that fails with an error once its token is cancelled, so a
/// timed-out or aborted read stops at the next chunk boundary.
pub struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancelToken,
}

impl<'a, R: Read> CancellableReader<'a, R> {
    pub fn new(inner: R, cancel: &'a CancelToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("read cancelled"));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_unaffected_by_identification() {
        let data = b"MZ this is not really an executable".repeat(400);
        let token = CancelToken::new();

        let plain = inspect_stream(data.as_slice(), &Sha256Digester, None, &token).unwrap();
        let identified = inspect_stream(
            data.as_slice(),
            &Sha256Digester,
            Some(&MagicIdentifier),
            &token,
        )
        .unwrap();

        assert_eq!(plain.digest, sha256(&data));
        assert_eq!(identified.digest, plain.digest);
        assert_eq!(plain.type_signature, None);
        assert_eq!(
            identified.type_signature.as_deref(),
            Some("PE32 executable (MS Windows)")
        );
    }

    #[test]
    fn cancelled_token_aborts_read() {
        let token = CancelToken::new();
        token.cancel();
        let result = inspect_stream(&b"abc"[..], &Sha256Digester, None, &token);
        assert!(result.is_err());
    }
}
