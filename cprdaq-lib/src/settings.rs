//! Configuration of the acquisition
//!
//! Everything which is fixed at load time. The
//! settings can be written to/read from a toml
//! file, e.g.
//!
//! ```text
//! n_dma_buffers = 4
//! dma_pages     = 9
//!
//! [module]
//! subsys = 0
//! crate_ = 0
//! slot   = 0
//! ```

use std::fmt;
use std::fs::File;
use std::io::{
  Read,
  Write,
};

use crate::constants::*;
use crate::errors::SettingsError;
use crate::memory::{
  DmaSource,
  UIO0,
};
use crate::run::ModuleIdentity;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DriverSettings {
  /// Number of buffers in the DMA ring
  pub n_dma_buffers        : usize,
  /// Size of one DMA buffer as 2^dma_pages pages
  pub dma_pages            : u32,
  pub page_size            : usize,
  /// Descriptor slots the event queue grows by
  pub queue_allotment      : usize,
  /// Maximum number of allotments, 0 means
  /// the queue grows as long as there is memory
  pub queue_max_allotments : usize,
  /// Reads of DMACSR0 before an abort is given up
  pub abort_retries        : usize,
  /// Log at most this many lost DMA done interrupts
  pub lost_intr_limit      : u32,
  /// Length FIFO almost full threshold
  pub lef_almost_full      : u32,
  /// Interrupt listener wakes up at least this often
  /// to check if it should stop
  pub irq_timeout_ms       : u64,
  /// UIO device with the PLX9054 and COPPER registers
  pub register_device      : String,
  /// Identity for the event headers
  pub module               : ModuleIdentity,
  /// Where the DMA buffers come from
  pub dma_source           : DmaSource,
}

impl DriverSettings {
  pub fn new() -> Self {
    Self {
      n_dma_buffers        : DEFAULT_N_DMA_BUFFERS,
      dma_pages            : DEFAULT_DMA_PAGES,
      page_size            : PAGE_SIZE,
      queue_allotment      : DEFAULT_QUEUE_ALLOTMENT,
      queue_max_allotments : 0,
      abort_retries        : DEFAULT_ABORT_RETRIES,
      lost_intr_limit      : DEFAULT_LOST_INTR_LIMIT,
      lef_almost_full      : DEFAULT_LEF_ALMOST_FULL,
      irq_timeout_ms       : 100,
      register_device      : String::from(UIO0),
      module               : ModuleIdentity::default(),
      dma_source           : DmaSource::Anonymous,
    }
  }

  /// Size of one DMA buffer in bytes
  pub fn dma_buffer_size(&self) -> usize {
    self.page_size << self.dma_pages
  }

  pub fn queue_limit(&self) -> Option<usize> {
    if self.queue_max_allotments == 0 {
      None
    } else {
      Some(self.queue_max_allotments)
    }
  }

  /// Write the settings to a toml file
  pub fn to_toml(&self, mut filename : String) -> Result<(), SettingsError> {
    if !filename.ends_with(".toml") {
      filename += ".toml";
    }
    info!("Will write to file {}!", filename);
    let toml_string = match toml::to_string_pretty(&self) {
      Err(err) => {
        error!("Unable to serialize toml! {err}");
        return Err(SettingsError::TomlEncodingError);
      }
      Ok(s) => s
    };
    match File::create(&filename) {
      Err(err) => {
        error!("Unable to open file {}! {}", filename, err);
        Err(SettingsError::IoError)
      }
      Ok(mut file) => {
        match file.write_all(toml_string.as_bytes()) {
          Err(err) => {
            error!("Unable to write to file {}! {}", filename, err);
            Err(SettingsError::IoError)
          }
          Ok(_) => {
            debug!("Wrote settings to {}!", filename);
            Ok(())
          }
        }
      }
    }
  }

  /// Write the settings to a json file
  pub fn to_json(&self, mut filename : String) -> Result<(), SettingsError> {
    if !filename.ends_with(".json") {
      filename += ".json";
    }
    info!("Will write to file {}!", filename);
    match File::create(&filename) {
      Err(err) => {
        error!("Unable to open file {}! {}", filename, err);
        Err(SettingsError::IoError)
      }
      Ok(file) => {
        match serde_json::to_writer_pretty(file, &self) {
          Err(err) => {
            error!("Unable to serialize json! {err}");
            Err(SettingsError::JsonEncodingError)
          }
          Ok(_) => {
            debug!("Wrote settings to {}!", filename);
            Ok(())
          }
        }
      }
    }
  }

  pub fn from_toml(filename : &str) -> Result<DriverSettings, SettingsError> {
    let mut toml_string = String::from("");
    match File::open(filename) {
      Err(err) => {
        error!("Unable to open {}! {}", filename, err);
        return Err(SettingsError::IoError);
      }
      Ok(mut file) => {
        if let Err(err) = file.read_to_string(&mut toml_string) {
          error!("Unable to read {}! {}", filename, err);
          return Err(SettingsError::IoError);
        }
      }
    }
    match toml::from_str(&toml_string) {
      Err(err) => {
        error!("Can't interpret toml! {}", err);
        Err(SettingsError::TomlDecodingError)
      }
      Ok(settings) => Ok(settings)
    }
  }
}

impl fmt::Display for DriverSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = match toml::to_string(self) {
      Err(err) => {
        error!("Serialization error! {err}");
        String::from("-- SERIALIZATION ERROR! --")
      }
      Ok(disp) => disp
    };
    write!(f, "<DriverSettings :\n{}>", disp)
  }
}

impl Default for DriverSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod test_settings {
  use super::*;

  #[test]
  fn default_buffer_size() {
    let settings = DriverSettings::new();
    assert_eq!(settings.dma_buffer_size(), 2*1024*1024);
    assert_eq!(settings.queue_limit(), None);
  }

  #[test]
  fn toml_roundtrip() {
    let mut settings = DriverSettings::new();
    settings.module     = ModuleIdentity::new(1, 2, 3);
    settings.dma_source = DmaSource::Uio(String::from("/dev/uio1"));
    let text = toml::to_string(&settings).unwrap();
    let back : DriverSettings = toml::from_str(&text).unwrap();
    assert_eq!(back, settings);
  }

  #[test]
  fn missing_file() {
    assert_eq!(DriverSettings::from_toml("/does/not/exist.toml"), Err(SettingsError::IoError));
  }
}
