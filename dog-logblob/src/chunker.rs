use bytes::{Bytes, BytesMut};

/// Re-chunks an arbitrary sequence of writes into fixed-size blocks.
///
/// Block boundaries depend only on `block_size`, never on how the input was
/// split across `push` calls.
#[derive(Debug)]
pub(crate) struct Chunker {
    block_size: usize,
    pending: BytesMut,
}

impl Chunker {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            block_size,
            pending: BytesMut::with_capacity(block_size),
        }
    }

    /// Feed bytes, returning every block completed by them
    pub(crate) fn push(&mut self, mut data: &[u8]) -> Vec<Bytes> {
        let mut blocks = Vec::new();
        while !data.is_empty() {
            let take = (self.block_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == self.block_size {
                blocks.push(self.pending.split().freeze());
            }
        }
        blocks
    }

    /// The trailing short block, if any
    pub(crate) fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.pending.split().freeze())
    }
}

/// Split a complete blob into blocks
pub(crate) fn chunk(data: &[u8], block_size: usize) -> Vec<Bytes> {
    let mut chunker = Chunker::new(block_size);
    let mut blocks = chunker.push(data);
    blocks.extend(chunker.finish());
    blocks
}
