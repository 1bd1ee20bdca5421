//! Sector-addressed storage.
//!
//! The physical eMMC driver lives outside this crate; it only has to implement
//! [`BlockDevice`]. File-backed images are provided by [`RawImage`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

pub const SECTOR_SIZE: usize = 512;

pub trait BlockDevice {
    /// Number of addressable 512 byte sectors.
    fn sector_count(&self) -> u64;

    /// Read `count` sectors starting at `start`. `buf` must be exactly `count` sectors long.
    fn read_sectors(&mut self, start: u64, count: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `count` sectors starting at `start`. `buf` must be exactly `count` sectors long.
    fn write_sectors(&mut self, start: u64, count: usize, buf: &[u8]) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }
    fn read_sectors(&mut self, start: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        (**self).read_sectors(start, count, buf)
    }
    fn write_sectors(&mut self, start: u64, count: usize, buf: &[u8]) -> Result<()> {
        (**self).write_sectors(start, count, buf)
    }
}

/// Check that `count` sectors at `start` fit both `buf` and the device.
pub(crate) fn check_request(device_sectors: u64, start: u64, count: usize, buf_len: usize) -> Result<()> {
    if buf_len != count * SECTOR_SIZE {
        return Err(Error::malformed(
            "sector buffer",
            format!("{} bytes for {} sectors", buf_len, count),
        ));
    }
    match start.checked_add(count as u64) {
        Some(end) if end <= device_sectors => Ok(()),
        _ => Err(Error::SectorIo {
            sector: start,
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} sectors past the end of a {} sector device", count, device_sectors),
            ),
        }),
    }
}

/// A file-backed NAND image.
///
/// Only whole sectors are addressable, so a trailing footer is never read or written
/// through this interface.
#[derive(Debug)]
pub struct RawImage<F> {
    inner: F,
    sectors: u64,
}

impl<F: Read + Write + Seek> RawImage<F> {
    pub fn new(mut inner: F) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        Ok(Self { inner, sectors: len / SECTOR_SIZE as u64 })
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn seek_to(&mut self, sector: u64) -> Result<()> {
        self.inner
            .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .map_err(|source| Error::SectorIo { sector, source })?;
        Ok(())
    }
}

impl RawImage<File> {
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(Error::file(path))?;
        Self::new(file)
    }
}

impl<F: Read + Write + Seek> BlockDevice for RawImage<F> {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sectors(&mut self, start: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        check_request(self.sectors, start, count, buf.len())?;
        self.seek_to(start)?;
        self.inner.read_exact(buf).map_err(|source| Error::SectorIo { sector: start, source })
    }

    fn write_sectors(&mut self, start: u64, count: usize, buf: &[u8]) -> Result<()> {
        check_request(self.sectors, start, count, buf.len())?;
        self.seek_to(start)?;
        self.inner.write_all(buf).map_err(|source| Error::SectorIo { sector: start, source })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn footer_is_not_addressable() {
        let image = RawImage::new(Cursor::new(vec![0u8; 4 * 512 + 64])).unwrap();
        assert_eq!(image.sector_count(), 4);
    }

    #[test]
    fn read_write() {
        let mut image = RawImage::new(Cursor::new(vec![0u8; 4 * 512])).unwrap();
        let data = vec![0xA5u8; 1024];
        image.write_sectors(2, 2, &data).unwrap();
        let mut back = vec![0u8; 1024];
        image.read_sectors(2, 2, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(&image.into_inner().into_inner()[..1024], &[0u8; 1024][..]);
    }

    #[test]
    fn out_of_range_is_io() {
        let mut image = RawImage::new(Cursor::new(vec![0u8; 2 * 512])).unwrap();
        let mut buf = vec![0u8; 1024];
        let error = image.read_sectors(1, 2, &mut buf).unwrap_err();
        assert!(matches!(error, Error::SectorIo { sector: 1, .. }));
        assert_eq!(error.kind(), crate::ErrorKind::Io);
    }

    #[test]
    fn buffer_length_must_match() {
        let mut image = RawImage::new(Cursor::new(vec![0u8; 2 * 512])).unwrap();
        let mut buf = vec![0u8; 500];
        assert!(matches!(image.read_sectors(0, 1, &mut buf), Err(Error::Malformed { .. })));
    }
}
