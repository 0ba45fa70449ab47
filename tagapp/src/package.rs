//! Trace package container: a flat file of named, length-prefixed entries.
//!
//! Layout: 4-byte magic `TRZ1`, then for each entry a 2-byte name length,
//! the UTF-8 name, a 4-byte data length and the data. All integers are
//! little-endian. Entries are read strictly in order.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::StorageError;

const PACKAGE_MAGIC: [u8; 4] = *b"TRZ1";

pub struct PackageWriter {
    file: BufWriter<File>,
}

impl PackageWriter {
    /// Create or truncate a package file.
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        let file = File::create(path).map_err(|_| StorageError::FileOpenFailed)?;
        let mut file = BufWriter::new(file);
        file.write_all(&PACKAGE_MAGIC).map_err(|_| StorageError::WriteDataFailed)?;
        Ok(PackageWriter { file })
    }

    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let name_bytes = name.as_bytes();
        self.file
            .write_all(&(name_bytes.len() as u16).to_le_bytes())
            .and_then(|_| self.file.write_all(name_bytes))
            .and_then(|_| self.file.write_all(&(data.len() as u32).to_le_bytes()))
            .and_then(|_| self.file.write_all(data))
            .map_err(|_| StorageError::WriteDataFailed)
    }

    pub fn finish(mut self) -> Result<(), StorageError> {
        self.file.flush().map_err(|_| StorageError::WriteDataFailed)
    }
}

pub struct PackageReader {
    file: BufReader<File>,
}

impl PackageReader {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = File::open(path).map_err(|_| StorageError::FileOpenFailed)?;
        let mut file = BufReader::new(file);

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).map_err(|_| StorageError::InvalidStorageFormat)?;
        if magic != PACKAGE_MAGIC {
            return Err(StorageError::InvalidStorageFormat);
        }

        Ok(PackageReader { file })
    }

    /// Read the next `(name, data)` entry, or `None` at end of package.
    pub fn next_entry(&mut self) -> Result<Option<(String, Vec<u8>)>, StorageError> {
        let mut len = [0u8; 2];
        match self.file.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(_) => return Err(StorageError::ReadDataFailed),
        }

        let name_len = u16::from_le_bytes(len) as usize;
        let mut name = vec![0u8; name_len];
        self.file.read_exact(&mut name).map_err(|_| StorageError::InvalidStorageFormat)?;
        let name = String::from_utf8(name).map_err(|_| StorageError::InvalidStorageFormat)?;

        let mut data_len = [0u8; 4];
        self.file.read_exact(&mut data_len).map_err(|_| StorageError::InvalidStorageFormat)?;
        let data_len = u32::from_le_bytes(data_len) as usize;

        let mut data = vec![0u8; data_len];
        self.file.read_exact(&mut data).map_err(|_| StorageError::ReadDataFailed)?;

        Ok(Some((name, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tagscope-pkg-{}-{name}", std::process::id()))
    }

    #[test]
    fn entries_round_trip_in_order() {
        let path = temp_path("roundtrip");

        let mut writer = PackageWriter::create(&path).unwrap();
        writer.add_entry("frame.json", br#"{"frames":[]}"#).unwrap();
        writer.add_entry("logic-0.apcm", &[1, 2, 3, 4]).unwrap();
        writer.add_entry("radio-0.apcm", &[]).unwrap();
        writer.finish().unwrap();

        let mut reader = PackageReader::open(&path).unwrap();
        let (name, data) = reader.next_entry().unwrap().unwrap();
        assert_eq!(name, "frame.json");
        assert_eq!(data, br#"{"frames":[]}"#);

        let (name, data) = reader.next_entry().unwrap().unwrap();
        assert_eq!(name, "logic-0.apcm");
        assert_eq!(data, [1, 2, 3, 4]);

        let (name, data) = reader.next_entry().unwrap().unwrap();
        assert_eq!(name, "radio-0.apcm");
        assert!(data.is_empty());

        assert!(reader.next_entry().unwrap().is_none());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn bad_magic_is_invalid_format() {
        let path = temp_path("badmagic");
        std::fs::write(&path, b"NOPE....").unwrap();
        assert!(matches!(PackageReader::open(&path), Err(StorageError::InvalidStorageFormat)));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_open_failure() {
        let path = temp_path("missing-not-created");
        assert!(matches!(PackageReader::open(&path), Err(StorageError::FileOpenFailed)));
    }
}
