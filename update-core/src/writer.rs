/// Block-buffered writer between upload chunks and a flash provider.
///
/// Upload chunks arrive with arbitrary lengths. The writer completes a partially
/// filled block first, writes the aligned bulk of the chunk straight through and
/// keeps the remainder for the next call. Only `finish` may issue a short block.
use log::trace;

use crate::flash::{FlashError, FlashStorage};

#[derive(Debug)]
pub struct ChunkedWriter {
    block: usize,
    pending: Vec<u8>,
    persisted: usize,
}

impl ChunkedWriter {
    pub fn new(block_size: usize) -> Self {
        let block = block_size.max(1);
        Self {
            block,
            pending: Vec::with_capacity(block),
            persisted: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    /// Bytes confirmed by the provider.
    pub fn persisted(&self) -> usize {
        self.persisted
    }

    /// Bytes accepted but still waiting for a full block.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Accept `chunk`, returning its length once every byte is either persisted or
    /// buffered. Any provider fault rejects the whole chunk.
    pub fn write<F: FlashStorage>(
        &mut self,
        flash: &mut F,
        handle: &mut F::Handle,
        chunk: &[u8],
    ) -> Result<usize, FlashError> {
        let mut rest = chunk;

        // Complete partial block
        if !self.pending.is_empty() {
            let take = (self.block - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.block {
                put(flash, handle, &self.pending)?;
                self.persisted += self.pending.len();
                self.pending.clear();
            }
        }

        // Write aligned bulk
        let aligned = rest.len() - rest.len() % self.block;
        if aligned > 0 {
            put(flash, handle, &rest[..aligned])?;
            self.persisted += aligned;
        }

        // Keep trailing bytes
        self.pending.extend_from_slice(&rest[aligned..]);

        trace!(
            "writer: {} accepted, {} persisted, {} buffered",
            chunk.len(),
            self.persisted,
            self.pending.len()
        );
        Ok(chunk.len())
    }

    /// Flush the final short block and return the total persisted length.
    pub fn finish<F: FlashStorage>(
        &mut self,
        flash: &mut F,
        handle: &mut F::Handle,
    ) -> Result<usize, FlashError> {
        if !self.pending.is_empty() {
            put(flash, handle, &self.pending)?;
            self.persisted += self.pending.len();
            self.pending.clear();
        }
        Ok(self.persisted)
    }
}

fn put<F: FlashStorage>(flash: &mut F, handle: &mut F::Handle, bytes: &[u8]) -> Result<(), FlashError> {
    let written = flash.write(handle, bytes)?;
    if written != bytes.len() {
        return Err(FlashError::ShortWrite {
            requested: bytes.len(),
            written,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SlotId;
    use crate::ram_flash::{RamFlash, WriteFault};
    use proptest::prelude::*;

    #[test]
    fn buffers_until_a_block_is_full() {
        let mut flash = RamFlash::new(1024).with_block_size(8);
        let mut handle = flash.reserve(SlotId(1), None).unwrap();
        let mut writer = ChunkedWriter::new(flash.write_block_size());

        assert_eq!(writer.write(&mut flash, &mut handle, b"abc").unwrap(), 3);
        assert_eq!(flash.write_calls(), 0);
        assert_eq!(writer.buffered(), 3);

        assert_eq!(writer.write(&mut flash, &mut handle, b"defghij").unwrap(), 7);
        assert_eq!(writer.persisted(), 8);
        assert_eq!(writer.buffered(), 2);
        assert_eq!(flash.slot_contents(SlotId(1)), b"abcdefgh");

        assert_eq!(writer.finish(&mut flash, &mut handle).unwrap(), 10);
        assert_eq!(flash.slot_contents(SlotId(1)), b"abcdefghij");
    }

    #[test]
    fn aligned_bulk_goes_straight_through() {
        let mut flash = RamFlash::new(1024).with_block_size(4);
        let mut handle = flash.reserve(SlotId(1), None).unwrap();
        let mut writer = ChunkedWriter::new(4);

        writer.write(&mut flash, &mut handle, &[1u8; 16]).unwrap();
        assert_eq!(flash.write_calls(), 1);
        assert_eq!(writer.buffered(), 0);
    }

    #[test]
    fn short_provider_write_rejects_the_chunk() {
        let mut flash = RamFlash::new(1024).with_block_size(4);
        flash.fail_write(0, WriteFault::Short);
        let mut handle = flash.reserve(SlotId(1), None).unwrap();
        let mut writer = ChunkedWriter::new(4);

        assert_eq!(
            writer.write(&mut flash, &mut handle, &[0xAA; 8]),
            Err(FlashError::ShortWrite {
                requested: 8,
                written: 4
            })
        );
    }

    #[test]
    fn device_fault_on_final_flush_is_reported() {
        let mut flash = RamFlash::new(1024).with_block_size(4);
        flash.fail_write(0, WriteFault::Device);
        let mut handle = flash.reserve(SlotId(1), None).unwrap();
        let mut writer = ChunkedWriter::new(4);

        writer.write(&mut flash, &mut handle, b"ab").unwrap();
        assert!(matches!(
            writer.finish(&mut flash, &mut handle),
            Err(FlashError::Device(_))
        ));
    }

    proptest! {
        #[test]
        fn persists_exact_concatenation(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            cuts in proptest::collection::vec(0usize..2048, 0..16),
            block in 1usize..64,
        ) {
            let mut flash = RamFlash::new(4096).with_block_size(block);
            let mut handle = flash.reserve(SlotId(1), None).unwrap();
            let mut writer = ChunkedWriter::new(block);

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(data.len())).collect();
            cuts.sort_unstable();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(data.len())) {
                let n = writer.write(&mut flash, &mut handle, &data[start..cut]).unwrap();
                prop_assert_eq!(n, cut - start);
                start = cut;
            }
            prop_assert_eq!(writer.finish(&mut flash, &mut handle).unwrap(), data.len());
            prop_assert_eq!(flash.slot_contents(SlotId(1)), data.as_slice());
        }
    }
}
