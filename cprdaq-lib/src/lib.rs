//! # cprdaq-lib
//!
//! Event data acquisition from the COPPER readout board.
//!
//! The board collects the data of up to four FINESSE front-end
//! cards into an event FIFO. A PLX9054 PCI bridge moves that data 
//! per DMA into a ring of host buffers, where the events are 
//! framed in place and queued for the (single) reader of the 
//! data node.
//!
//! The pipeline, leaf first:
//!
//! * `memory`      - register access and DMA memory
//! * `dma_buffer`  - the ring of DMA buffers
//! * `framer`      - find event records in a completed transfer
//! * `event_queue` - descriptors of framed events, oldest first
//! * `dma_engine`  - decide when and where the next transfer goes
//! * `threads`     - interrupt top half and deferred bottom half
//! * `device`      - the character device nodes and the read path
//!

pub mod constants;
pub mod errors;
pub mod registers;
pub mod memory;
pub mod control;
pub mod dma_buffer;
pub mod framer;
pub mod event_queue;
pub mod dma_engine;
pub mod run;
pub mod pipeline;
pub mod threads;
pub mod ioctl;
pub mod device;
pub mod settings;
pub mod sim;

pub use settings::DriverSettings;
pub use pipeline::Pipeline;
pub use device::{
  Driver,
  Session,
};

use std::io::Write;

use colored::{Colorize, ColoredString};
use log::Level;

#[macro_use] extern crate log;
extern crate env_logger;

/// Make sure that the loglevel is in color
pub fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error    => String::from(" ERROR!").red(),
    Level::Warn     => String::from(" WARN  ").yellow(),
    Level::Info     => String::from(" Info  ").green(),
    Level::Debug    => String::from(" debug ").blue(),
    Level::Trace    => String::from(" trace ").cyan(),
  }
}

/// Set up the environmental (env) logger
/// with our format
///
/// Ensure that the lines and module paths
/// are printed in the logging output
pub fn init_env_logger() {
  env_logger::builder()
    .format(|buf, record| {
    writeln!( buf, "[{level}][{module_path}:{line}] {args}",
      level = color_log(&record.level()),
      module_path = record.module_path().unwrap_or("<unknown>"),
      line = record.line().unwrap_or(0),
      args = record.args()
      )
    }).init();
}
