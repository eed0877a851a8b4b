use bytes::{Bytes, BytesMut};

/// A write-only byte sink shared by every variable serialized within one component, so that
/// a `Tuple`/`Dict`/etc. reducer can append its encoded constructor and args without
/// knowing anything about chunk boundaries.
///
/// `current_chunk` harvests everything written since the last `reset`, handing it to the
/// caller as an immutable, cheaply-cloneable [`Bytes`]. `reset` is called by the serializer
/// after a variable's bytes have been harvested into its `Dump`, or after a rollback
/// discards a failed variable's partial output.
#[derive(Debug, Default)]
pub struct ChunkedWriter {
    buf: BytesMut,
}

impl ChunkedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` to the current chunk.
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The bytes accumulated since the last `reset`, without discarding them.
    pub fn current_chunk(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// Discard everything written since the last reset (or since construction).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes accumulated since the last reset.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
