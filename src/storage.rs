//! Persistent byte storage collaborators for the history record
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Byte addressed persistent storage with an explicit durable commit
///
/// Writes are buffered; nothing is durable until [`NvStorage::commit`].
/// Never written storage reads back as 0xFF, like erased flash.
pub trait NvStorage {
    /// Read one byte at `offset`
    fn read(&mut self, offset: usize) -> u8;
    /// Buffer one byte at `offset`
    fn write(&mut self, offset: usize, value: u8);
    /// Flush the buffered writes to the durable medium
    fn commit(&mut self);
}

/// In memory storage, for tests and dry runs
#[derive(Debug, Clone)]
pub struct MemStorage {
    image: Vec<u8>,
}

impl MemStorage {
    /// Create an erased (all 0xFF) storage of `size` bytes
    pub fn new(size: usize) -> MemStorage {
        MemStorage {
            image: vec![0xFF; size],
        }
    }
}

impl NvStorage for MemStorage {
    fn read(&mut self, offset: usize) -> u8 {
        self.image.get(offset).copied().unwrap_or(0xFF)
    }

    fn write(&mut self, offset: usize, value: u8) {
        if offset < self.image.len() {
            self.image[offset] = value;
        }
    }

    fn commit(&mut self) {}
}

/// File backed storage emulating a small EEPROM area
///
/// The whole image lives in RAM; [`NvStorage::commit`] rewrites the file.
/// An I/O failure on commit is logged and swallowed: losing one history
/// save is preferable to stopping the bridge.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileStorage {
    /// Open `path`, loading the previous image when present
    pub fn open<P: AsRef<Path>>(path: P, size: usize) -> io::Result<FileStorage> {
        let path = path.as_ref().to_path_buf();
        let mut image = match fs::read(&path) {
            Ok(image) => image,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        image.resize(size, 0xFF);
        Ok(FileStorage { path, image })
    }
}

impl NvStorage for FileStorage {
    fn read(&mut self, offset: usize) -> u8 {
        self.image.get(offset).copied().unwrap_or(0xFF)
    }

    fn write(&mut self, offset: usize, value: u8) {
        if offset < self.image.len() {
            self.image[offset] = value;
        }
    }

    fn commit(&mut self) {
        if let Err(e) = fs::write(&self.path, &self.image) {
            warn!("history storage commit error: {}", e);
        }
    }
}
