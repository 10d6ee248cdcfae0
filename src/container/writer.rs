// Container writer - header up front, payloads appended, index on finish

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{ContainerHeader, Result, HEADER_LEN, INDEX_OFFSET_POS};
use crate::pipeline::{FrameSink, FrameTag};

/// Number of empty slots implied by a timestamp gap of `dt` seconds between
/// two consecutive frames spaced `interval` seconds apart nominally.
///
/// Rounds to the nearest whole frame: a gap of exactly two intervals means
/// one frame is missing.
pub fn missing_slots_between(dt: f64, interval: f64) -> u64 {
    if interval <= 0.0 || !dt.is_finite() {
        return 0;
    }
    let extra = (dt / interval - 0.5).floor();
    if extra > 0.0 { extra as u64 } else { 0 }
}

/// Slot on the nominal frame grid for a frame `timestamp` seconds into the
/// stream. Never returns a slot at or before `previous`.
pub fn frame_slot(timestamp: f64, framerate: f64, previous: Option<u64>) -> u64 {
    let next = previous.map_or(0, |p| p + 1);
    if framerate <= 0.0 || !timestamp.is_finite() {
        return next;
    }
    ((timestamp * framerate).round().max(0.0) as u64).max(next)
}

/// Build the offset table for packets written back to back from
/// `first_offset`. Each packet is `(slot, byte_len)` with increasing slots;
/// the first packet's slot is index entry 0 and skipped slots become zeros.
pub fn build_index(packets: &[(u64, u64)], first_offset: u64) -> Vec<u64> {
    let mut index = Vec::with_capacity(packets.len());
    let mut offset = first_offset;
    let base = packets.first().map_or(0, |&(slot, _)| slot);

    for &(slot, len) in packets {
        let position = slot.saturating_sub(base) as usize;
        if position > index.len() {
            index.resize(position, 0);
        }
        index.push(offset);
        offset += len;
    }

    index
}

/// Writes one compressed frame stream to disk
pub struct ContainerWriter {
    path: PathBuf,
    file: BufWriter<File>,
    header: ContainerHeader,
    packets: Vec<(u64, u64)>,
    position: u64,
    finished: bool,
}

impl ContainerWriter {
    /// Create the file and write the header with a zero index offset.
    /// Failing here is the only fatal container error.
    pub fn create(path: impl AsRef<Path>, header: ContainerHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);

        let mut header = header;
        header.index_offset = 0;
        file.write_all(&header.to_bytes())?;

        log::debug!("Container {} created ({}x{}, {} bit)", path.display(), header.width, header.height, header.bitcount);

        Ok(Self {
            path,
            file,
            header,
            packets: Vec::new(),
            position: HEADER_LEN as u64,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn frames_written(&self) -> usize {
        self.packets.len()
    }

    /// Bytes in the file so far (header and payloads)
    pub fn bytes_written(&self) -> u64 {
        self.position
    }

    /// Append the payload of grid slot `slot`. Slots must increase; a slot
    /// that does not is written into the next free entry. On error the write
    /// position is rewound so a later packet overwrites the partial one.
    pub fn write_packet(&mut self, slot: u64, data: &[u8]) -> Result<u64> {
        if let Err(e) = self.file.write_all(data) {
            let _ = self.file.seek(SeekFrom::Start(self.position));
            return Err(e.into());
        }
        let len = data.len() as u64;
        let slot = match self.packets.last() {
            Some(&(last, _)) if slot <= last => last + 1,
            _ => slot,
        };
        self.packets.push((slot, len));
        self.position += len;
        Ok(len)
    }

    /// Append the index and patch its offset into the header. Returns the
    /// index start offset; repeated calls write nothing.
    pub fn finish(&mut self) -> Result<u64> {
        if self.finished {
            return Ok(self.header.index_offset);
        }

        let index_offset = self.position;
        let index = build_index(&self.packets, HEADER_LEN as u64);

        self.file.seek(SeekFrom::Start(index_offset))?;
        for entry in &index {
            self.file.write_all(&entry.to_le_bytes())?;
        }
        self.file.seek(SeekFrom::Start(INDEX_OFFSET_POS))?;
        self.file.write_all(&index_offset.to_le_bytes())?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;

        self.header.index_offset = index_offset;
        self.finished = true;

        log::info!(
            "Container {} finalized: {} frames, {} index slots",
            self.path.display(),
            self.packets.len(),
            index.len()
        );
        Ok(index_offset)
    }
}

impl FrameSink<Vec<u8>> for ContainerWriter {
    fn write(&mut self, tag: FrameTag, item: Vec<u8>) -> std::io::Result<u64> {
        self.write_packet(tag.slot, &item).map_err(|e| match e {
            super::ContainerError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        })
    }

    fn finish(&mut self) -> std::io::Result<()> {
        ContainerWriter::finish(self).map(|_| ()).map_err(|e| match e {
            super::ContainerError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        })
    }

    fn outputs(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = ContainerWriter::finish(self) {
                log::error!("Failed to finalize container {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_slots_round_to_nearest_frame() {
        let interval = 1.0 / 30.0;
        assert_eq!(missing_slots_between(interval, interval), 0);
        assert_eq!(missing_slots_between(1.4 * interval, interval), 0);
        assert_eq!(missing_slots_between(1.6 * interval, interval), 1);
        assert_eq!(missing_slots_between(2.0 * interval, interval), 1);
        assert_eq!(missing_slots_between(3.0 * interval, interval), 2);
        assert_eq!(missing_slots_between(-1.0, interval), 0);
        assert_eq!(missing_slots_between(1.0, 0.0), 0);
    }

    #[test]
    fn slots_follow_the_nominal_grid() {
        assert_eq!(frame_slot(0.0, 10.0, None), 0);
        assert_eq!(frame_slot(0.1, 10.0, Some(0)), 1);
        // Frame at 0.2 never arrived
        assert_eq!(frame_slot(0.3, 10.0, Some(1)), 3);
        assert_eq!(frame_slot(0.149, 10.0, Some(0)), 1);
        // Jitter that rounds onto a used slot moves to the next one
        assert_eq!(frame_slot(0.34, 10.0, Some(3)), 4);
        assert_eq!(frame_slot(5.0, 0.0, Some(6)), 7);
    }

    #[test]
    fn index_places_zero_in_the_gap() {
        let packets = [(0, 10), (1, 20), (3, 5), (4, 7)];
        let index = build_index(&packets, 48);
        assert_eq!(index, vec![48, 58, 0, 78, 83]);
    }

    #[test]
    fn index_starts_at_the_first_slot() {
        let packets = [(33, 10), (35, 20)];
        assert_eq!(build_index(&packets, 48), vec![48, 0, 58]);
    }

    #[test]
    fn empty_stream_has_empty_index() {
        assert!(build_index(&[], 48).is_empty());
    }
}
