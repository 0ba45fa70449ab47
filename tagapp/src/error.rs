use thiserror::Error;

/// Storage failure taxonomy, mirrored into command rejection codes.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum StorageError {
    #[error("Missing parameters")]
    MissingParameters,

    #[error("Missing file name")]
    MissingFileName,

    #[error("File open failed")]
    FileOpenFailed,

    #[error("Read data failed")]
    ReadDataFailed,

    #[error("Write data failed")]
    WriteDataFailed,

    #[error("Invalid storage format")]
    InvalidStorageFormat,
}

impl StorageError {
    pub fn code(&self) -> i32 {
        match self {
            StorageError::MissingParameters => 101,
            StorageError::MissingFileName => 102,
            StorageError::FileOpenFailed => 103,
            StorageError::ReadDataFailed => 104,
            StorageError::WriteDataFailed => 105,
            StorageError::InvalidStorageFormat => 106,
        }
    }
}

#[derive(Debug, Error)]
pub enum LabError {
    #[error("device is not present")]
    DeviceAbsent,

    #[error("device reported firmware version {found}, expected major {expected}")]
    FirmwareVersion { expected: u8, found: String },

    #[error("usb speed is too low for streaming")]
    UsbSpeed,

    #[error("no profile matches device {vid:04x}:{pid:04x}")]
    UnknownDevice { vid: u16, pid: u16 },

    #[error("firmware file could not be read: {0}")]
    FirmwareFile(String),

    #[error("device security check failed")]
    SecurityCheck,

    #[error("cannot set samplerate while in test mode")]
    TestModePolicy,

    #[error("usb transfer failed: {0}")]
    Usb(#[from] rusb::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
