//! MD5 digests, streaming hashing and composite multipart ETags.
//!
//! A finished multipart object's identity tag is the MD5 of the
//! concatenated raw part digests, rendered as lowercase hex, followed by
//! `-N` where N is the number of parts. Single-part objects use their
//! content digest directly with no suffix.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use md5::{Digest, Md5};
use tokio::io::{AsyncRead, ReadBuf};

use crate::errors::S3Error;

/// A raw 128-bit MD5 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    /// Digest of the empty input.
    pub const EMPTY_HEX: &'static str = "d41d8cd98f00b204e9800998ecf8427e";

    /// Compute the MD5 of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self(finalize(hasher))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex digest. Surrounding double quotes (as ETags are usually
    /// sent) are ignored, and hex case does not matter.
    pub fn from_hex(s: &str) -> Option<Self> {
        let trimmed = s.trim().trim_matches('"');
        let mut out = [0u8; 16];
        hex::decode_to_slice(trimmed, &mut out).ok()?;
        Some(Self(out))
    }

    /// Whether a caller-supplied hex string names this digest.
    pub fn matches_hex(&self, s: &str) -> bool {
        Self::from_hex(s).is_some_and(|other| other == *self)
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn finalize(hasher: Md5) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Compose the identity tag for a multipart object from its ordered part digests.
pub fn composite_etag(parts: &[Md5Digest]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    format!("{}-{}", hex::encode(hasher.finalize()), parts.len())
}

/// Compose the identity tag from hex part ETags.
///
/// Fails with [`S3Error::InvalidPart`] on the first entry that is not a
/// 32-digit hex digest.
pub fn composite_etag_from_hex(etags: &[&str]) -> Result<String, S3Error> {
    let mut digests = Vec::with_capacity(etags.len());
    for (i, etag) in etags.iter().enumerate() {
        let digest = Md5Digest::from_hex(etag).ok_or_else(|| S3Error::InvalidPart {
            part_number: i as u32 + 1,
            message: format!("ETag {etag} is not a valid MD5 digest"),
        })?;
        digests.push(digest);
    }
    Ok(composite_etag(&digests))
}

/// `AsyncRead` adapter that hashes and counts every byte read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Md5,
    bytes_read: u64,
    read_error: Option<io::ErrorKind>,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            bytes_read: 0,
            read_error: None,
        }
    }

    /// Bytes observed so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Kind of the last error returned by the wrapped reader, if any. Lets a
    /// consumer tell a failing source apart from its own write failures.
    pub fn read_error(&self) -> Option<io::ErrorKind> {
        self.read_error
    }

    /// Mutable access to the wrapped reader. Bytes read through it directly
    /// are not hashed.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the reader, returning the digest and the byte count.
    pub fn finish(self) -> (Md5Digest, u64) {
        (Md5Digest(finalize(self.hasher)), self.bytes_read)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                this.hasher.update(fresh);
                this.bytes_read += fresh.len() as u64;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.read_error = Some(e.kind());
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
