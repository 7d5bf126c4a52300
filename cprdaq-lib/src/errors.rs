//! Error types of the acquisition pipeline
//!
//! Only a few of these ever reach the user of
//! the device nodes (`DeviceError`). Everything
//! else is dealt with by the immediate caller.

use std::error::Error;
use std::fmt;

/// Problems with the access to the hardware,
/// e.g. mapping the UIO regions
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BridgeError {
  MMapFail,
  DeviceNotFound,
  AddressNotFound,
  InterruptFail,
  Unknown,
}

impl BridgeError {
  pub fn to_string(&self) -> String {
    match self {
      BridgeError::MMapFail        => {return String::from("MMapFail");},
      BridgeError::DeviceNotFound  => {return String::from("DeviceNotFound");},
      BridgeError::AddressNotFound => {return String::from("AddressNotFound");},
      BridgeError::InterruptFail   => {return String::from("InterruptFail");},
      BridgeError::Unknown         => {return String::from("Unknown");},
    }
  }
}

impl fmt::Display for BridgeError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<BridgeError: {}>", self.to_string())
  }
}

impl Error for BridgeError {
}

/// The errors a user of the device nodes
/// gets to see (the errno of the driver)
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DeviceError {
  /// The hardware behind this minor was never discovered
  NoSuchDevice,
  /// Somebody has the node already open
  Busy,
  /// Unknown ioctl opcode or direction
  InvalidArgument,
  /// The buffer handed over is not usable
  Fault,
  /// A blocking read was interrupted
  Interrupted,
}

impl DeviceError {
  pub fn to_string(&self) -> String {
    match self {
      DeviceError::NoSuchDevice    => {return String::from("NoSuchDevice");},
      DeviceError::Busy            => {return String::from("Busy");},
      DeviceError::InvalidArgument => {return String::from("InvalidArgument");},
      DeviceError::Fault           => {return String::from("Fault");},
      DeviceError::Interrupted     => {return String::from("Interrupted");},
    }
  }
}

impl fmt::Display for DeviceError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<DeviceError: {}>", self.to_string())
  }
}

impl Error for DeviceError {
}

/// Failures of the event queue
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum QueueError {
  /// No descriptor slot left and the
  /// queue could not grow
  QueueOverflow,
  /// The slot is not part of the ready list
  NotQueued,
}

impl fmt::Display for QueueError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      QueueError::QueueOverflow => "QueueOverflow",
      QueueError::NotQueued     => "NotQueued",
    };
    write!(f, "<QueueError: {}>", etype)
  }
}

impl Error for QueueError {
}

/// The DMA buffer ring can not take a transfer
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PoolError {
  /// The next buffer in the ring still holds
  /// events which have not been read
  BufferFull,
  /// The transfer would not even fit
  /// into an empty buffer
  OversizeTransfer,
}

impl fmt::Display for PoolError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      PoolError::BufferFull       => "BufferFull",
      PoolError::OversizeTransfer => "OversizeTransfer",
    };
    write!(f, "<PoolError: {}>", etype)
  }
}

impl Error for PoolError {
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SettingsError {
  IoError,
  TomlDecodingError,
  TomlEncodingError,
  JsonEncodingError,
}

impl fmt::Display for SettingsError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      SettingsError::IoError           => "IoError",
      SettingsError::TomlDecodingError => "TomlDecodingError",
      SettingsError::TomlEncodingError => "TomlEncodingError",
      SettingsError::JsonEncodingError => "JsonEncodingError",
    };
    write!(f, "<SettingsError: {}>", etype)
  }
}

impl Error for SettingsError {
}
