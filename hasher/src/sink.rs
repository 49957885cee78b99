//! This module provides the sink capabilities fed by the hashing pipeline.
//!
//! A [`Sink`] is the destination for one file's bytes, delivered as ordered chunks. Sinks that
//! accumulate a digest additionally expose the [`Finalizer`] capability; the engine resolves it
//! once per request, when the file has been fully read, instead of inspecting the sink's concrete
//! type throughout the pipeline.

use digest::{Digest, FixedOutputReset};

/// Destination for one file's bytes.
///
/// Chunks are delivered in file order, one [`write`](Sink::write) call per chunk.
pub trait Sink: Send {
    /// Append a chunk of file content.
    fn write(&mut self, bytes: &[u8]);

    /// Expose the finalize capability of digest-accumulating sinks.
    ///
    /// Plain byte sinks keep the default; their callers read progress off the sink itself once it
    /// is handed back with the result.
    fn finalizer(&mut self) -> Option<&mut dyn Finalizer> {
        None
    }
}

/// Finalize capability of digest-producing sinks.
pub trait Finalizer {
    /// Produce the digest over all bytes written so far, resetting the accumulator so the sink
    /// could be reused for another file.
    fn finalize_reset(&mut self) -> Vec<u8>;
}

/// A [`Sink`] accumulating any [RustCrypto](digest) digest incrementally.
///
/// # Example
/// ```
/// use hasher::sink::{DigestSink, Finalizer, Sink};
///
/// let mut sink = DigestSink::<sha1::Sha1>::new();
/// sink.write(b"foobar");
///
/// let digest = sink.finalizer().unwrap().finalize_reset();
/// assert_eq!(hex::encode(digest), "8843d7f92416211de9ebb963ff4ce28125932878");
/// ```
#[derive(Debug, Default)]
pub struct DigestSink<D>(D);

impl<D: Digest> DigestSink<D> {
    /// Create a sink with a fresh digest accumulator.
    pub fn new() -> Self {
        Self(D::new())
    }
}

impl<D: Digest + FixedOutputReset + Send> Sink for DigestSink<D> {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        Digest::update(&mut self.0, bytes);
    }

    #[inline]
    fn finalizer(&mut self) -> Option<&mut dyn Finalizer> {
        Some(self)
    }
}

impl<D: Digest + FixedOutputReset + Send> Finalizer for DigestSink<D> {
    fn finalize_reset(&mut self) -> Vec<u8> {
        Digest::finalize_reset(&mut self.0).to_vec()
    }
}

/// SHA-1 digest sink.
pub type Sha1Sink = DigestSink<sha1::Sha1>;

/// Plain in-memory byte sink, with no finalize capability.
impl Sink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_sink_matches_one_shot_digest() {
        let mut sink = Sha1Sink::new();
        sink.write(b"foo");
        sink.write(b"bar");

        let digest = sink.finalizer().unwrap().finalize_reset();
        assert_eq!(digest, sha1::Sha1::digest(b"foobar").to_vec());
    }

    #[test]
    fn test_finalize_resets_accumulator() {
        let mut sink = Sha1Sink::new();
        sink.write(b"scrap");
        let _ = sink.finalizer().unwrap().finalize_reset();

        let empty = sink.finalizer().unwrap().finalize_reset();
        assert_eq!(hex::encode(empty), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_plain_sink_has_no_finalizer() {
        let mut sink: Vec<u8> = vec![];
        sink.write(b"raw bytes");

        assert!(sink.finalizer().is_none());
        assert_eq!(sink, b"raw bytes");
    }
}
