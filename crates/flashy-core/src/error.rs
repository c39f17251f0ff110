//! Error types for flashy
//!
//! Every component returns the most specific [`Error`] variant available and
//! adds one line of context at each call boundary with [`Error::context`].
//! [`Error::kind`] always reports the innermost failure, so classification
//! code never has to parse messages.

use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// flashy errors
#[derive(Debug, Error)]
pub enum Error {
    /// Device identifier is not of the form `type:specifier`
    #[error("Invalid flash device id '{id}': expected '<type>:<specifier>'")]
    Parse { id: String },

    /// No factory registered for the device type
    #[error("Unknown flash device type '{0}'")]
    UnknownDeviceType(String),

    /// No device table entry matches the specifier
    #[error("No entry for flash device '{specifier}' in '{table}'")]
    DeviceTableMismatch { specifier: String, table: PathBuf },

    /// Device table size field is not a hexadecimal u64
    #[error("Unable to parse size '{value}' as hexadecimal: {source}")]
    SizeParse {
        value: String,
        #[source]
        source: ParseIntError,
    },

    /// Device file path does not look like the expected raw device node
    #[error("Device file path '{path}' does not match required pattern '{pattern}'")]
    DeviceMismatch { path: PathBuf, pattern: &'static str },

    /// Image does not fit on the device
    #[error("Image size ({image_size}B) larger than flash device size ({device_size}B)")]
    ImageTooLarge { image_size: u64, device_size: u64 },

    /// Read-only offset lies beyond the end of the image
    #[error("RO offset ({ro_offset}B) larger than image size ({image_size}B)")]
    OffsetExceedsImage { image_size: u64, ro_offset: u64 },

    /// MEMERASE failed
    #[error("Flash device '{path}' erase failed at offset {offset:#x}: {source}")]
    EraseFailure {
        path: PathBuf,
        offset: u32,
        #[source]
        source: io::Error,
    },

    /// Positioned write failed or made no progress
    #[error("Failed to program flash device '{path}' at offset {offset:#x}: {source}")]
    ProgramFailure {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Device contents differ from the image after programming
    #[error(
        "Verification failed: flash and image data mismatch beginning at {offset:#x} (RO offset {ro_offset:#x})"
    )]
    VerifyMismatch { offset: u64, ro_offset: u64 },

    /// Image or partition validator rejected the data
    #[error("Validation of '{target}' failed: {reason}")]
    ValidationFailure { target: String, reason: String },

    /// Another flashing-capable process is running
    #[error("Another flasher running: '{name}' found in cmdline '{cmdline}'")]
    ConcurrentFlasherDetected { name: String, cmdline: String },

    /// External command exceeded its deadline and was killed
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Device driver ioctl failed
    #[error("{call} failed on '{path}': {source}")]
    DriverCall {
        call: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Filesystem or mapping error on a specific path
    #[error("'{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The host has no verified boot utility
    #[error("Not a vboot system")]
    NotVbootSystem,

    /// External command could not be run or exited non-zero
    #[error("Command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    /// Configuration could not be loaded
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// One line of context wrapped around a lower-level error
    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

/// Failure taxonomy, independent of the context chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    UnknownDeviceType,
    DeviceTableMismatch,
    SizeParseError,
    DeviceMismatch,
    ImageTooLarge,
    OffsetExceedsImage,
    EraseFailure,
    ProgramFailure,
    VerifyMismatch,
    ValidationFailure,
    ConcurrentFlasherDetected,
    Timeout,
    DriverCallFailure,
    Io,
    NotVbootSystem,
    Command,
    Config,
}

impl Error {
    /// Wrap this error with one line of context
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for [`Error::Io`]
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The innermost failure kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::ParseError,
            Self::UnknownDeviceType(_) => ErrorKind::UnknownDeviceType,
            Self::DeviceTableMismatch { .. } => ErrorKind::DeviceTableMismatch,
            Self::SizeParse { .. } => ErrorKind::SizeParseError,
            Self::DeviceMismatch { .. } => ErrorKind::DeviceMismatch,
            Self::ImageTooLarge { .. } => ErrorKind::ImageTooLarge,
            Self::OffsetExceedsImage { .. } => ErrorKind::OffsetExceedsImage,
            Self::EraseFailure { .. } => ErrorKind::EraseFailure,
            Self::ProgramFailure { .. } => ErrorKind::ProgramFailure,
            Self::VerifyMismatch { .. } => ErrorKind::VerifyMismatch,
            Self::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            Self::ConcurrentFlasherDetected { .. } => ErrorKind::ConcurrentFlasherDetected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DriverCall { .. } => ErrorKind::DriverCallFailure,
            Self::Io { .. } => ErrorKind::Io,
            Self::NotVbootSystem => ErrorKind::NotVbootSystem,
            Self::Command { .. } => ErrorKind::Command,
            Self::Config(_) => ErrorKind::Config,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Render the full source chain on one line, outermost first
    pub fn chain(&self) -> String {
        // Context already prints its source, so only walk foreign sources.
        let mut out = self.to_string();
        let mut current: Option<&(dyn std::error::Error + 'static)> = self.innermost_source();
        while let Some(err) = current {
            let msg = err.to_string();
            if !out.ends_with(&msg) {
                out.push_str(": ");
                out.push_str(&msg);
            }
            current = err.source();
        }
        out
    }

    fn innermost_source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Context { source, .. } => source.innermost_source(),
            other => std::error::Error::source(other),
        }
    }
}

/// Adds [`Error::context`] to results
pub trait ResultExt<T> {
    /// Wrap the error, if any, with one line of context
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Like [`ResultExt::context`], building the message lazily
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(message))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// Result type for flashy operations
pub type Result<T> = std::result::Result<T, Error>;
