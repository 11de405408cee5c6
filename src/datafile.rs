use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use crate::config::FILE_MODE;
use crate::error::Result;

/// A database-owned file with positional reads and writes.
///
/// Backs both the values file and the keys log; record framing lives with
/// the caller. The logical length is tracked so appends never have to seek
/// to rediscover the end of file. Exclusive ownership by one owner thread is
/// assumed, which is what makes the seek-then-write pairs safe.
#[derive(Debug)]
pub struct DataFile {
    file: File,
    len: u64,
    path: PathBuf,
    #[cfg(test)]
    fail_next_write: bool,
}

impl DataFile {
    /// Opens the file read/write, creating it if absent.
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.create(true).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(FILE_MODE);
        }
        let file = opts.open(path)?;
        let len = file.metadata()?.len();

        Ok(DataFile {
            file,
            len,
            path: path.to_path_buf(),
            #[cfg(test)]
            fail_next_write: false,
        })
    }

    /// Makes the next append or write_at fail, for exercising the partial
    /// write paths without real disk faults.
    #[cfg(test)]
    pub(crate) fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    #[cfg(test)]
    fn take_injected_fault(&mut self) -> Result<()> {
        if self.fail_next_write {
            self.fail_next_write = false;
            return Err(crate::Error::Io("injected write failure".to_string()));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical end of file, i.e. the offset the next append will return.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `data`, returning the offset it was written at.
    pub fn append(&mut self, data: &[u8], sync: bool) -> Result<u64> {
        #[cfg(test)]
        self.take_injected_fault()?;
        let offset = self.len;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        if sync {
            self.file.sync_all()?;
        }
        Ok(offset)
    }

    /// Overwrites in place at `offset`. The caller guarantees the slot being
    /// overwritten is at least `data.len()` bytes.
    pub fn write_at(&mut self, data: &[u8], offset: u64, sync: bool) -> Result<()> {
        #[cfg(test)]
        self.take_injected_fault()?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.len = self.len.max(offset + data.len() as u64);
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Reads exactly `size` bytes starting at `offset`.
    pub fn read_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads the whole file. Used only by open-time replay.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Durability barrier.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
