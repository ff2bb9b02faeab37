//! slab 文件句柄：按偏移读写

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::{EngineError, Result};

pub struct SlabFile {
    file: File,
}

impl SlabFile {
    /// 新建文件并预分配 `len` 字节
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self { file })
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { file: File::open(path)? })
    }

    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// 从 `offset` 读满 `buf`，文件提前结束时返回 ShortRead
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(EngineError::ShortRead { expected: buf.len(), actual: filled })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn write_all_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_at_offset_and_reports_short_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.slab");
        let mut f = SlabFile::create(&path, 32).unwrap();
        f.write_all_at(10, b"hello").unwrap();

        let mut f = SlabFile::open(&path).unwrap();
        let mut buf = [0u8; 5];
        f.read_exact_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let mut big = [0u8; 8];
        assert!(matches!(
            f.read_exact_at(28, &mut big),
            Err(EngineError::ShortRead { expected: 8, actual: 4 })
        ));
        assert!(SlabFile::create(&path, 1).is_err());
    }
}
