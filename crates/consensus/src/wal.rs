//! Write-Ahead Log for consensus events.
//!
//! The WAL is the crash-recovery ground truth: every event is appended and
//! fsynced (`write_sync`) before the state machine acts on it, and an
//! `EndHeight(h)` marker is written after height `h` commits. Replaying
//! the log from the last marker reconstructs the state machine's view
//! without ever permitting a second signature at an already-signed
//! `(height, round, step)`.
//!
//! ## Frame format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ CRC32 (4 bytes, LE)  │ Length (4 bytes, LE)                      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Payload: serialized TimedWalMessage (variable length)            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The checksum covers the payload only. A truncated or checksum-bad
//! trailing frame is discarded on open (the file is truncated back to the
//! last valid frame); corruption before intact frames makes the WAL refuse
//! to open.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use tessera_types::Height;

use crate::current_time_ms;
use crate::messages::{TimedWalMessage, WalMessage};

/// Frame header size: checksum + length.
const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single frame payload. A frame must fit a full block
/// part plus envelope overhead.
pub const MAX_WAL_MSG_SIZE_BYTES: usize = 2 * 1024 * 1024;

/// Errors from WAL operations
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// I/O error on the log file
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame failed its checksum or structural checks
    #[error("corrupted WAL frame at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset of the bad frame
        offset: u64,
        /// What was wrong with it
        message: String,
    },

    /// A frame larger than the permitted maximum
    #[error("WAL frame of {size} bytes exceeds the maximum {max}")]
    FrameTooLarge {
        /// Claimed frame size
        size: usize,
        /// The maximum
        max: usize,
    },

    /// Serialization of a payload failed
    #[error("WAL serialization error: {0}")]
    Serialization(String),
}

/// Result type for WAL operations
pub type WalResult<T> = Result<T, WalError>;

/// Append-only, CRC-framed write-ahead log.
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
}

impl Wal {
    /// Open (or create) the WAL at `path`.
    ///
    /// The existing file is scanned front to back. With `strict` false,
    /// trailing corruption is discarded by truncating to the last valid
    /// frame; with `strict` true any corruption refuses the open.
    pub fn open(path: &Path, strict: bool) -> WalResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening consensus WAL");

        let valid_len = scan_valid_length(path, strict)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let actual_len = file.metadata()?.len();
        if valid_len < actual_len {
            warn!(
                valid = valid_len,
                actual = actual_len,
                "discarding corrupt WAL tail"
            );
            file.set_len(valid_len)?;
        }
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            offset: valid_len,
        })
    }

    /// Append a message without syncing.
    pub fn write(&mut self, msg: WalMessage) -> WalResult<()> {
        let timed = TimedWalMessage {
            time: current_time_ms(),
            msg,
        };
        let payload =
            serde_json::to_vec(&timed).map_err(|e| WalError::Serialization(e.to_string()))?;
        if payload.len() > MAX_WAL_MSG_SIZE_BYTES {
            return Err(WalError::FrameTooLarge {
                size: payload.len(),
                max: MAX_WAL_MSG_SIZE_BYTES,
            });
        }

        let crc = crc32fast::hash(&payload);
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.offset += (FRAME_HEADER_SIZE + payload.len()) as u64;
        Ok(())
    }

    /// Append a message and fsync it to disk.
    ///
    /// The state machine calls this before acting on any event; after it
    /// returns, the event survives a crash.
    pub fn write_sync(&mut self, msg: WalMessage) -> WalResult<()> {
        self.write(msg)?;
        self.flush_and_sync()
    }

    /// Flush buffered frames and fsync.
    pub fn flush_and_sync(&mut self) -> WalResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh read cursor over the whole log.
    ///
    /// The reader uses its own file descriptor; the writer keeps appending
    /// independently.
    pub fn reader(&mut self) -> WalResult<WalReader> {
        self.flush_and_sync()?;
        WalReader::open(&self.path)
    }

    /// Scan for the `EndHeight(height)` marker and return a reader
    /// positioned just AFTER it, or `None` when the marker is absent.
    ///
    /// Malformed frames encountered during the scan are skipped and
    /// recorded as gaps on the returned reader.
    pub fn search_for_end_height(&mut self, height: Height) -> WalResult<Option<WalReader>> {
        self.flush_and_sync()?;
        let mut reader = WalReader::open(&self.path)?;
        loop {
            match reader.next_message() {
                Ok(Some(timed)) => {
                    if let WalMessage::EndHeight(h) = timed.msg {
                        if h == height {
                            debug!(height, gaps = reader.gaps(), "found EndHeight marker");
                            return Ok(Some(reader));
                        }
                    }
                }
                Ok(None) => return Ok(None),
                // next_message already records skipped garbage as gaps and
                // continues; an Err here is a hard I/O failure.
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Forward cursor over WAL frames.
pub struct WalReader {
    reader: BufReader<File>,
    offset: u64,
    len: u64,
    gaps: usize,
}

impl WalReader {
    fn open(path: &Path) -> WalResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
            len,
            gaps: 0,
        })
    }

    /// Number of malformed frames skipped so far.
    pub fn gaps(&self) -> usize {
        self.gaps
    }

    /// Read the next message, skipping malformed frames.
    ///
    /// Returns `Ok(None)` at the end of the log. A malformed frame bumps
    /// the gap counter and resynchronizes at the following byte offset by
    /// scanning forward one byte at a time.
    pub fn next_message(&mut self) -> WalResult<Option<TimedWalMessage>> {
        loop {
            if self.offset + FRAME_HEADER_SIZE as u64 > self.len {
                return Ok(None);
            }
            match self.try_read_frame()? {
                FrameOutcome::Message(msg) => return Ok(Some(msg)),
                FrameOutcome::Garbage => {
                    self.gaps += 1;
                    // Resynchronize one byte forward.
                    self.offset += 1;
                    self.reader.seek(SeekFrom::Start(self.offset))?;
                }
                FrameOutcome::Eof => return Ok(None),
            }
        }
    }

    fn try_read_frame(&mut self) -> WalResult<FrameOutcome> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(FrameOutcome::Eof),
            Err(e) => return Err(WalError::Io(e)),
        }
        let crc = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let length = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;

        if length > MAX_WAL_MSG_SIZE_BYTES
            || self.offset + (FRAME_HEADER_SIZE + length) as u64 > self.len
        {
            self.reader.seek(SeekFrom::Start(self.offset))?;
            return Ok(FrameOutcome::Garbage);
        }

        let mut payload = vec![0u8; length];
        match self.reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.reader.seek(SeekFrom::Start(self.offset))?;
                return Ok(FrameOutcome::Garbage);
            }
            Err(e) => return Err(WalError::Io(e)),
        }

        if crc32fast::hash(&payload) != crc {
            self.reader.seek(SeekFrom::Start(self.offset))?;
            return Ok(FrameOutcome::Garbage);
        }

        match serde_json::from_slice::<TimedWalMessage>(&payload) {
            Ok(msg) => {
                self.offset += (FRAME_HEADER_SIZE + length) as u64;
                Ok(FrameOutcome::Message(msg))
            }
            Err(_) => {
                self.reader.seek(SeekFrom::Start(self.offset))?;
                Ok(FrameOutcome::Garbage)
            }
        }
    }
}

enum FrameOutcome {
    Message(TimedWalMessage),
    Garbage,
    Eof,
}

/// Scan the file front to back and return the byte length of the valid
/// frame prefix.
///
/// With `strict` true, any invalid data is an error. Otherwise invalid
/// data is tolerated only at the tail: if more parseable frames follow the
/// corruption, the file is damaged in the middle and the WAL refuses to
/// open.
fn scan_valid_length(path: &Path, strict: bool) -> WalResult<u64> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(WalError::Io(e)),
    };
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;

    loop {
        if offset == len {
            return Ok(offset);
        }
        let remaining = len - offset;
        if remaining < FRAME_HEADER_SIZE as u64 {
            break;
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let crc = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let length = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;

        if length > MAX_WAL_MSG_SIZE_BYTES
            || (FRAME_HEADER_SIZE + length) as u64 > remaining
        {
            break;
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            break;
        }
        offset += (FRAME_HEADER_SIZE + length) as u64;
    }

    // Invalid data found at `offset`.
    if strict {
        return Err(WalError::Corrupted {
            offset,
            message: "invalid frame (strict recovery)".into(),
        });
    }

    // Tolerate a corrupt tail, refuse a corrupt middle: if any complete
    // valid frame can be parsed after the corruption, earlier records were
    // not intact and the log is untrustworthy.
    if has_valid_frame_after(path, offset, len)? {
        return Err(WalError::Corrupted {
            offset,
            message: "corruption followed by intact frames".into(),
        });
    }
    Ok(offset)
}

/// Whether any valid frame parses at some byte position after `from`.
fn has_valid_frame_after(path: &Path, from: u64, len: u64) -> WalResult<bool> {
    let mut file = File::open(path)?;
    let mut position = from + 1;
    while position + FRAME_HEADER_SIZE as u64 <= len {
        file.seek(SeekFrom::Start(position))?;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        if file.read_exact(&mut header).is_err() {
            break;
        }
        let crc = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let length = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
        if length <= MAX_WAL_MSG_SIZE_BYTES
            && position + (FRAME_HEADER_SIZE + length) as u64 <= len
        {
            let mut payload = vec![0u8; length];
            if file.read_exact(&mut payload).is_ok()
                && crc32fast::hash(&payload) == crc
                && serde_json::from_slice::<TimedWalMessage>(&payload).is_ok()
            {
                return Ok(true);
            }
        }
        position += 1;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ConsensusMessage, StateEvent};
    use tessera_types::{BlockId, Proposal};

    fn proposal_msg(height: Height) -> WalMessage {
        WalMessage::Event(StateEvent::Internal(ConsensusMessage::Proposal(
            Proposal::new(height, 0, -1, BlockId::zero()),
        )))
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, true).unwrap();

        wal.write_sync(proposal_msg(1)).unwrap();
        wal.write_sync(WalMessage::EndHeight(1)).unwrap();
        wal.write_sync(proposal_msg(2)).unwrap();

        let mut reader = wal.reader().unwrap();
        let first = reader.next_message().unwrap().unwrap();
        assert_eq!(first.msg, proposal_msg(1));
        let second = reader.next_message().unwrap().unwrap();
        assert_eq!(second.msg, WalMessage::EndHeight(1));
        let third = reader.next_message().unwrap().unwrap();
        assert_eq!(third.msg, proposal_msg(2));
        assert!(reader.next_message().unwrap().is_none());
        assert_eq!(reader.gaps(), 0);
    }

    #[test]
    fn test_search_for_end_height() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, true).unwrap();

        for h in 1..=3 {
            wal.write_sync(proposal_msg(h)).unwrap();
            wal.write_sync(WalMessage::EndHeight(h)).unwrap();
        }
        wal.write_sync(proposal_msg(4)).unwrap();

        // Positioned just after EndHeight(2): the next frame is height 3's.
        let mut reader = wal.search_for_end_height(2).unwrap().unwrap();
        let next = reader.next_message().unwrap().unwrap();
        assert_eq!(next.msg, proposal_msg(3));

        assert!(wal.search_for_end_height(9).unwrap().is_none());
    }

    #[test]
    fn test_trailing_corruption_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, false).unwrap();
        wal.write_sync(proposal_msg(1)).unwrap();
        wal.write_sync(proposal_msg(2)).unwrap();
        let good_size = wal.size();
        drop(wal);

        // Simulate a torn write: half a frame of garbage at the tail.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0xff, 0xff]).unwrap();
        drop(file);

        let mut wal = Wal::open(&path, false).unwrap();
        assert_eq!(wal.size(), good_size);
        let mut reader = wal.reader().unwrap();
        assert_eq!(reader.next_message().unwrap().unwrap().msg, proposal_msg(1));
        assert_eq!(reader.next_message().unwrap().unwrap().msg, proposal_msg(2));
        assert!(reader.next_message().unwrap().is_none());
    }

    #[test]
    fn test_strict_mode_refuses_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, true).unwrap();
        wal.write_sync(proposal_msg(1)).unwrap();
        drop(wal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x00; 5]).unwrap();
        drop(file);

        assert!(matches!(
            Wal::open(&path, true),
            Err(WalError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_corruption_before_intact_frames_refuses_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, false).unwrap();
        wal.write_sync(proposal_msg(1)).unwrap();
        let first_frame_end = wal.size();
        wal.write_sync(proposal_msg(2)).unwrap();
        drop(wal);

        // Flip a byte inside the first frame's payload: the second frame is
        // still intact, so recovery must refuse rather than silently drop
        // the prefix.
        let mut contents = std::fs::read(&path).unwrap();
        contents[(first_frame_end / 2) as usize] ^= 0xff;
        std::fs::write(&path, contents).unwrap();

        assert!(matches!(
            Wal::open(&path, false),
            Err(WalError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, true).unwrap();

        let huge = Proposal::new(1, 0, -1, BlockId::zero());
        let mut msg = ConsensusMessage::Proposal(huge);
        if let ConsensusMessage::Proposal(p) = &mut msg {
            p.signature = tessera_crypto::Signature(vec![0u8; MAX_WAL_MSG_SIZE_BYTES + 1]);
        }
        let result = wal.write_sync(WalMessage::Event(StateEvent::Internal(msg)));
        assert!(matches!(result, Err(WalError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_roundtrip_preserves_order_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, true).unwrap();

        let messages: Vec<WalMessage> = (1..=20)
            .map(|h| {
                if h % 5 == 0 {
                    WalMessage::EndHeight(h)
                } else {
                    proposal_msg(h)
                }
            })
            .collect();
        for msg in &messages {
            wal.write(msg.clone()).unwrap();
        }
        wal.flush_and_sync().unwrap();

        let mut reader = wal.reader().unwrap();
        let mut read_back = Vec::new();
        while let Some(timed) = reader.next_message().unwrap() {
            read_back.push(timed.msg);
        }
        assert_eq!(read_back, messages);
    }
}
