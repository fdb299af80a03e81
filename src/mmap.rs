use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// A shared, writable file mapping. All process-shared regions (main SHM,
/// ext SHM, mailboxes) go through this type; typed access is offset-based so
/// a remap never leaves a dangling view behind.
pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Creates the file with `O_EXCL`, zero-filled to `len`. Fails with
    /// `Exists` if the file is already there (the caller opens it instead).
    pub fn create_new(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = match OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::Exists(path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Grows the backing file and replaces the mapping. Offsets stay valid,
    /// addresses do not; callers must not hold views across this call.
    pub fn grow(&mut self, new_len: usize) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        self.file.set_len(new_len as u64)?;
        self.remap()
    }

    /// Re-reads the file length and remaps if it grew (another process may
    /// have extended the region).
    pub fn remap(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len() as usize;
        if len == self.len {
            return Ok(());
        }
        self.map = unsafe { MmapOptions::new().len(len).map_mut(&self.file)? };
        self.len = len;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = self.checked_end(offset, len)?;
        Ok(&self.map[offset..end])
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = self.checked_end(offset, len)?;
        Ok(&mut self.map[offset..end])
    }

    /// Typed view at `offset`. The caller guarantees `T` is a `#[repr(C)]`
    /// shared-memory record valid for any bit pattern of the region.
    pub fn view<T>(&self, offset: usize) -> Result<&T> {
        self.check_typed::<T>(offset, 1)?;
        Ok(unsafe { &*(self.map.as_ptr().add(offset) as *const T) })
    }

    /// Typed slice view of `count` records at `offset`.
    pub fn slice<T>(&self, offset: usize, count: usize) -> Result<&[T]> {
        self.check_typed::<T>(offset, count)?;
        Ok(unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset) as *const T, count) })
    }

    pub fn view_mut<T>(&mut self, offset: usize) -> Result<&mut T> {
        self.check_typed::<T>(offset, 1)?;
        Ok(unsafe { &mut *(self.map.as_mut_ptr().add(offset) as *mut T) })
    }

    pub fn slice_mut<T>(&mut self, offset: usize, count: usize) -> Result<&mut [T]> {
        self.check_typed::<T>(offset, count)?;
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(offset) as *mut T, count)
        })
    }

    fn check_typed<T>(&self, offset: usize, count: usize) -> Result<()> {
        let size = std::mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(Error::Internal("shm view size overflow".into()))?;
        self.checked_end(offset, size)?;
        if (self.map.as_ptr() as usize + offset) % std::mem::align_of::<T>() != 0 {
            return Err(Error::Internal(format!("misaligned shm view at {offset}")));
        }
        Ok(())
    }

    fn checked_end(&self, offset: usize, len: usize) -> Result<usize> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Internal("shm range overflow".into()))?;
        if end > self.len {
            return Err(Error::Internal(format!(
                "shm range {offset}+{len} out of bounds ({})",
                self.len
            )));
        }
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_and_grow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.shm");

        let mut created = MmapFile::create_new(&path, 64).unwrap();
        created.bytes_mut(0, 4).unwrap().copy_from_slice(b"abcd");

        assert!(matches!(
            MmapFile::create_new(&path, 64),
            Err(Error::Exists(_))
        ));

        let mut opened = MmapFile::open(&path).unwrap();
        assert_eq!(opened.bytes(0, 4).unwrap(), b"abcd");

        created.grow(128).unwrap();
        opened.remap().unwrap();
        assert_eq!(opened.len(), 128);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.shm");
        let map = MmapFile::create_new(&path, 16).unwrap();
        assert!(map.bytes(8, 16).is_err());
        assert!(map.slice::<u64>(0, 3).is_err());
    }
}
