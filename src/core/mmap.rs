use std::fs::File;

use memmap2::{MmapMut, MmapOptions};

use crate::core::{Error, Result};

/// A shared, writable mapping of a file that other processes map too.
pub struct SharedMap {
    map: MmapMut,
}

impl SharedMap {
    /// Maps the first `len` bytes of `file`, growing the file if needed.
    pub fn map(file: &File, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
        }
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(Self { map })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }
}
