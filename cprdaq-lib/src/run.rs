//! Bookkeeping of the current run

use std::fmt;

use chrono::{
  DateTime,
  Utc,
};

/// Who we are, this goes into every event header
#[derive(Debug, Copy, Clone, PartialEq, Default, serde::Deserialize, serde::Serialize)]
pub struct ModuleIdentity {
  pub subsys : u32,
  pub crate_ : u32,
  pub slot   : u32,
}

impl ModuleIdentity {
  pub fn new(subsys : u32, crate_ : u32, slot : u32) -> Self {
    Self {
      subsys,
      crate_,
      slot,
    }
  }
}

impl fmt::Display for ModuleIdentity {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<ModuleIdentity: subsys {} crate {} slot {}>", self.subsys, self.crate_, self.slot)
  }
}

#[derive(Debug, Clone)]
pub struct RunState {
  /// Number of the next event handed to the reader
  pub event_number  : u32,
  /// DMA transfers started
  pub dma_count     : u64,
  /// Attempts to start a transfer
  pub dma_try_count : u64,
  /// No new transfers, reader gets EOF once drained
  pub end_run       : bool,
  /// FIFO full was seen (latched)
  pub fifo_full     : bool,
  /// An event larger than a DMA buffer was seen (latched)
  pub too_much      : bool,
  /// Incremented by `init_run` and `clear_dma`, sessions
  /// use it to notice that their read state is stale
  pub epoch         : u64,
  pub started       : DateTime<Utc>,
}

impl RunState {
  pub fn new() -> Self {
    Self {
      event_number  : 0,
      dma_count     : 0,
      dma_try_count : 0,
      end_run       : false,
      fifo_full     : false,
      too_much      : false,
      epoch         : 0,
      started       : Utc::now(),
    }
  }

  /// Everything back to zero, a new epoch begins
  pub fn clear(&mut self) {
    let epoch = self.epoch + 1;
    *self = Self::new();
    self.epoch = epoch;
  }
}

impl Default for RunState {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<RunState:");
    repr += &(format!("\n  started       : {}", self.started));
    repr += &(format!("\n  event_number  : {}", self.event_number));
    repr += &(format!("\n  dma_count     : {}", self.dma_count));
    repr += &(format!("\n  dma_try_count : {}", self.dma_try_count));
    repr += &(format!("\n  end_run       : {}", self.end_run));
    repr += &(format!("\n  fifo_full     : {}", self.fifo_full));
    repr += &(format!("\n  too_much      : {}", self.too_much));
    repr += &(format!("\n  epoch         : {}>", self.epoch));
    write!(f, "{}", repr)
  }
}
