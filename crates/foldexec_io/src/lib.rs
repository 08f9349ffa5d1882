//! Buffered file abstraction for spilling and cross-worker overflow.
//!
//! A [`BufFile`] is a write-then-read temporary file. Writers append raw bytes
//! or length-prefixed records; `rewind` flushes and flips the file into read
//! mode. Files can also be reopened by path from another worker, which is how
//! redistribution overflow gets drained by its consumer.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use foldexec_error::{FoldexecError, Result, ResultExt};
use tracing::trace;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
enum BufFileState {
    Writing(BufWriter<File>),
    Reading(BufReader<File>),
}

/// A buffered on-disk file of bytes or length-prefixed records.
#[derive(Debug)]
pub struct BufFile {
    path: PathBuf,
    state: BufFileState,
    /// Whether this handle created the file and is responsible for removing
    /// it on drop.
    owned: bool,
}

impl BufFile {
    /// Create a new temporary file with a unique name.
    ///
    /// The label ends up in the file name to make on-disk debugging bearable.
    pub fn create_temp(label: &str) -> Result<Self> {
        let id = NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("foldexec-{}-{}-{}.tmp", std::process::id(), label, id);
        let path = std::env::temp_dir().join(name);
        Self::create_at(&path)
    }

    /// Create a new file at the given path, truncating anything there.
    pub fn create_at(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .context_fn(|| format!("failed to create buffered file at {}", path.display()))?;
        trace!(path = %path.display(), "created buffered file");
        Ok(BufFile {
            path: path.to_path_buf(),
            state: BufFileState::Writing(BufWriter::new(file)),
            owned: true,
        })
    }

    /// Open an existing file by name for reading.
    ///
    /// The opener does not own the file; the creator removes it.
    pub fn open_path(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .context_fn(|| format!("failed to open buffered file at {}", path.display()))?;
        Ok(BufFile {
            path: path.to_path_buf(),
            state: BufFileState::Reading(BufReader::new(file)),
            owned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes. Only valid while writing.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.state {
            BufFileState::Writing(w) => {
                w.write_all(bytes).context("failed to write to buffered file")
            }
            BufFileState::Reading(_) => Err(FoldexecError::new(
                "attempted to write to a buffered file opened for reading",
            )),
        }
    }

    /// Append one length-prefixed record.
    pub fn write_record(&mut self, payload: &[u8]) -> Result<()> {
        let len = i32::try_from(payload.len())
            .map_err(|_| FoldexecError::new("record too large for buffered file"))?;
        self.write_bytes(&len.to_le_bytes())?;
        self.write_bytes(payload)
    }

    pub fn flush(&mut self) -> Result<()> {
        if let BufFileState::Writing(w) = &mut self.state {
            w.flush().context("failed to flush buffered file")?;
        }
        Ok(())
    }

    /// Flush pending writes and flip the file into read mode at offset zero.
    pub fn rewind(&mut self) -> Result<()> {
        let file = match &mut self.state {
            BufFileState::Writing(w) => {
                w.flush().context("failed to flush buffered file")?;
                w.get_mut()
                    .try_clone()
                    .context("failed to clone file handle")?
            }
            BufFileState::Reading(r) => r
                .get_mut()
                .try_clone()
                .context("failed to clone file handle")?,
        };
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(0))
            .context("failed to seek buffered file")?;
        self.state = BufFileState::Reading(reader);
        Ok(())
    }

    /// Read exactly `buf.len()` bytes.
    ///
    /// Returns false on a clean end-of-file at a record boundary; errors if
    /// the file ends partway through.
    pub fn try_read_exact(&mut self, buf: &mut [u8]) -> Result<bool> {
        let reader = match &mut self.state {
            BufFileState::Reading(r) => r,
            BufFileState::Writing(_) => {
                return Err(FoldexecError::new(
                    "attempted to read a buffered file still in write mode",
                ))
            }
        };

        let mut filled = 0;
        while filled < buf.len() {
            let n = reader
                .read(&mut buf[filled..])
                .context("failed to read from buffered file")?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(FoldexecError::new("unexpected eof in buffered file"));
            }
            filled += n;
        }
        Ok(true)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.try_read_exact(buf)? {
            return Err(FoldexecError::new("unexpected eof in buffered file"));
        }
        Ok(())
    }

    /// Read the next length-prefixed record, or None at end-of-file.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        if !self.try_read_exact(&mut len_bytes)? {
            return Ok(None);
        }
        let len = i32::from_le_bytes(len_bytes);
        if len < 0 {
            return Err(FoldexecError::new("negative record length in buffered file"));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_exact(&mut payload)?;
        Ok(Some(payload))
    }
}

impl Drop for BufFile {
    fn drop(&mut self) {
        if self.owned {
            // File may already be gone if the consumer cleaned up the temp
            // dir; nothing useful to do with the error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip() {
        let mut file = BufFile::create_temp("test-records").unwrap();
        file.write_record(b"first").unwrap();
        file.write_record(b"").unwrap();
        file.write_record(b"third record").unwrap();

        file.rewind().unwrap();
        assert_eq!(Some(b"first".to_vec()), file.read_record().unwrap());
        assert_eq!(Some(Vec::new()), file.read_record().unwrap());
        assert_eq!(Some(b"third record".to_vec()), file.read_record().unwrap());
        assert_eq!(None, file.read_record().unwrap());
    }

    #[test]
    fn raw_bytes_then_eof() {
        let mut file = BufFile::create_temp("test-raw").unwrap();
        file.write_bytes(&[1, 2, 3, 4]).unwrap();
        file.rewind().unwrap();

        let mut buf = [0u8; 4];
        assert!(file.try_read_exact(&mut buf).unwrap());
        assert_eq!([1, 2, 3, 4], buf);
        assert!(!file.try_read_exact(&mut buf).unwrap());
    }

    #[test]
    fn partial_trailing_bytes_error() {
        let mut file = BufFile::create_temp("test-partial").unwrap();
        file.write_bytes(&[9, 9]).unwrap();
        file.rewind().unwrap();

        let mut buf = [0u8; 4];
        assert!(file.try_read_exact(&mut buf).is_err());
    }

    #[test]
    fn open_by_path_sees_writers_flushed_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.buf");

        let mut writer = BufFile::create_at(&path).unwrap();
        writer.write_record(b"shipped row").unwrap();
        writer.flush().unwrap();

        let mut reader = BufFile::open_path(&path).unwrap();
        assert_eq!(Some(b"shipped row".to_vec()), reader.read_record().unwrap());
        assert_eq!(None, reader.read_record().unwrap());
    }

    #[test]
    fn writing_after_rewind_is_an_error() {
        let mut file = BufFile::create_temp("test-mode").unwrap();
        file.write_record(b"x").unwrap();
        file.rewind().unwrap();
        assert!(file.write_bytes(b"y").is_err());
    }
}
