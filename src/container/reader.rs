// Container reader - header, index and per-slot payload access

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::{max_compressed_len, ContainerError, ContainerHeader, Result, COMPRESSION_LZ4, HEADER_LEN};

pub struct ContainerReader {
    file: File,
    header: ContainerHeader,
    index: Vec<u64>,
}

impl ContainerReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();

        let mut raw = [0u8; HEADER_LEN];
        file.read_exact(&mut raw)
            .map_err(|_| ContainerError::Truncated(format!("{} bytes", file_len)))?;
        let header = ContainerHeader::from_bytes(&raw)?;

        if header.compression != COMPRESSION_LZ4 {
            return Err(ContainerError::UnsupportedCompression(
                String::from_utf8_lossy(&header.compression).trim_end_matches('\0').to_string(),
            ));
        }
        if header.index_offset == 0 {
            return Err(ContainerError::Unfinalized);
        }
        if header.index_offset < HEADER_LEN as u64 || header.index_offset > file_len {
            return Err(ContainerError::Truncated(format!(
                "index offset {} outside file of {} bytes",
                header.index_offset, file_len
            )));
        }

        let slots = ((file_len - header.index_offset) / 8) as usize;
        let mut table = vec![0u8; slots * 8];
        file.seek(SeekFrom::Start(header.index_offset))?;
        file.read_exact(&mut table)?;
        let index = table
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        Ok(Self { file, header, index })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn index(&self) -> &[u64] {
        &self.index
    }

    /// Number of slots, recorded or not
    pub fn frame_count(&self) -> usize {
        self.index.len()
    }

    pub fn recorded_frames(&self) -> usize {
        self.index.iter().filter(|&&o| o != 0).count()
    }

    pub fn missing_slots(&self) -> Vec<usize> {
        self.index
            .iter()
            .enumerate()
            .filter(|(_, &o)| o == 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Compressed size of the payload in `slot`: distance to the next
    /// recorded payload, or to the index for the last one.
    pub fn payload_len(&self, slot: usize) -> Option<u64> {
        let start = *self.index.get(slot)?;
        if start == 0 {
            return None;
        }
        let end = self.index[slot + 1..]
            .iter()
            .copied()
            .find(|&o| o != 0)
            .unwrap_or(self.header.index_offset);
        Some(end.saturating_sub(start))
    }

    /// Compressed bytes of `slot`, `None` for a missing slot
    pub fn read_payload(&mut self, slot: usize) -> Result<Option<Vec<u8>>> {
        if slot >= self.index.len() {
            return Err(ContainerError::SlotOutOfRange(slot));
        }
        let Some(len) = self.payload_len(slot) else {
            return Ok(None);
        };
        let max = max_compressed_len(self.header.frame_len());
        if len > max as u64 {
            return Err(ContainerError::OversizedPayload { slot, len, max });
        }
        let mut data = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(self.index[slot]))?;
        self.file.read_exact(&mut data)?;
        Ok(Some(data))
    }

    /// Decompressed pixels of `slot`, `None` for a missing slot
    pub fn read_frame(&mut self, slot: usize) -> Result<Option<Vec<u8>>> {
        let Some(payload) = self.read_payload(slot)? else {
            return Ok(None);
        };
        lz4_flex::block::decompress(&payload, self.header.frame_len())
            .map(Some)
            .map_err(|e| ContainerError::Decompress(e.to_string()))
    }

    /// Pixels of `slot`, or of the closest recorded slot before it
    pub fn read_frame_or_previous(&mut self, slot: usize) -> Result<Option<Vec<u8>>> {
        if slot >= self.index.len() {
            return Err(ContainerError::SlotOutOfRange(slot));
        }
        match (0..=slot).rev().find(|&i| self.index[i] != 0) {
            Some(recorded) => self.read_frame(recorded),
            None => Ok(None),
        }
    }
}
