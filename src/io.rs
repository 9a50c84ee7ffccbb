

//! Specialized binary input for the random-access image files.
//!
//! JPEG 2000 files are big-endian, so all typed reads decode
//! big-endian values, reversing the bytes on little-endian hosts.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use lebe::prelude::*;

use crate::error::{Error, Result, UnitResult};


/// A read-only file with a tracked offset and bounded size.
/// Every session works on its own reader, as the offset is mutable state.
#[derive(Debug)]
pub struct FileReader {
    read: BufReader<File>,
    position: u64,
    size: u64,
}

impl FileReader {

    /// Opens the file for reading and determines its size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        Ok(FileReader {
            read: BufReader::new(file),
            position: 0,
            size,
        })
    }

    /// The total number of bytes in the file.
    #[inline]
    pub fn size(&self) -> u64 { self.size }

    /// The current read offset, from the beginning of the file.
    #[inline]
    pub fn offset(&self) -> u64 { self.position }

    /// Moves the read offset to an absolute position.
    pub fn seek_to(&mut self, offset: u64) -> UnitResult {
        self.read.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }

    /// Moves the read offset relative to the current position.
    pub fn seek_by(&mut self, delta: i64) -> UnitResult {
        self.read.seek_relative(delta)?;

        self.position = if delta < 0 {
            self.position.checked_sub(delta.unsigned_abs())
                .ok_or_else(|| Error::bad_image("seek before the start of the file"))?
        }
        else {
            self.position + delta as u64
        };

        Ok(())
    }

    /// Skips the given number of bytes without reading them.
    pub fn skip(&mut self, count: u64) -> UnitResult {
        let delta = i64::try_from(count)
            .map_err(|_| Error::bad_image("absurd skip length"))?;

        self.seek_by(delta)
    }

    /// Fills the whole buffer with bytes from the current offset.
    pub fn read_exact(&mut self, buffer: &mut [u8]) -> UnitResult {
        self.read.read_exact(buffer)?;
        self.position += buffer.len() as u64;
        Ok(())
    }

    /// Fills the whole buffer and then reverses it, which converts
    /// a big-endian file value into a little-endian memory value.
    pub fn read_reverse(&mut self, buffer: &mut [u8]) -> UnitResult {
        debug_assert!(buffer.len() <= 8, "reversed reads are for single values");
        self.read_exact(buffer)?;
        buffer.reverse();
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let value: u8 = self.read.read_from_big_endian()?;
        self.position += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let value: u16 = self.read.read_from_big_endian()?;
        self.position += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value: u32 = self.read.read_from_big_endian()?;
        self.position += 4;
        Ok(value)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let value: u64 = self.read.read_from_big_endian()?;
        self.position += 8;
        Ok(value)
    }
}

use std::convert::TryFrom;
