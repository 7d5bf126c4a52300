//! The interrupt top half
//!
//! Has to be quick: look at INTCSR once, switch off
//! further PCI interrupts of the bridge and leave the
//! rest to the bottom half. Neither the event queue nor
//! the DMA buffers are touched here.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{
  AtomicBool,
  Ordering,
};
use std::thread;
use std::time::Duration;

use crate::control;
use crate::memory::{
  InterruptLine,
  RegisterBlock,
};
use crate::pipeline::Pipeline;
use crate::registers::{
  INTCSR,
  INTCSR_PCI_INT_ENABLE,
  INTCSR_LOCAL_INT_ACTIVE,
  INTCSR_DMA0_INT_ACTIVE,
};

/// Did we handle the interrupt
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum IrqReturn {
  /// Not ours (line might be shared)
  NotOurs,
  Handled,
}

/// Decoded INTCSR of the PLX9054
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct InterruptStatus {
  pub raw : u32,
}

impl InterruptStatus {
  pub fn from_raw(raw : u32) -> Self {
    Self {
      raw
    }
  }

  pub fn pci_int_enabled(&self) -> bool {
    self.raw & INTCSR_PCI_INT_ENABLE != 0
  }

  /// DMA channel 0 finished
  pub fn dma0_done(&self) -> bool {
    self.raw & INTCSR_DMA0_INT_ACTIVE != 0
  }

  /// The COPPER raised its interrupt
  pub fn local_active(&self) -> bool {
    self.raw & INTCSR_LOCAL_INT_ACTIVE != 0
  }
}

impl fmt::Display for InterruptStatus {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<InterruptStatus: {:08x} pci_en {} dma0 {} local {}>",
           self.raw, self.pci_int_enabled(), self.dma0_done(), self.local_active())
  }
}

pub fn top_half(pipeline : &Pipeline) -> IrqReturn {
  let bridge = pipeline.bridge();
  let status = InterruptStatus::from_raw(bridge.read_reg32(RegisterBlock::Plx9054, INTCSR));
  if !status.pci_int_enabled() {
    return IrqReturn::NotOurs;
  }
  let bogus = !(status.local_active() || status.dma0_done());
  if bogus {
    trace!("No PLX9054 active interrupt source {}", status);
  } else {
    trace!("PLX9054 ring! {}", status);
  }
  pipeline.count_interrupt(bogus);
  control::disable_pci_intr(bridge);
  pipeline.schedule_work();
  IrqReturn::Handled
}

/// Wait for the interrupt line and run the top half
///
/// # Arguments
///
/// * pipeline : the driver context
/// * line     : the interrupt line of the PLX9054
/// * stop     : end the thread when set
/// * timeout  : look at stop at least this often
pub fn interrupt_listener(pipeline : Arc<Pipeline>,
                          line     : Arc<dyn InterruptLine>,
                          stop     : Arc<AtomicBool>,
                          timeout  : Duration) {
  info!("Interrupt listener started");
  while !stop.load(Ordering::Relaxed) {
    match line.wait_asserted(timeout) {
      Err(err) => {
        error!("Waiting for the interrupt failed! {}", err);
        thread::sleep(timeout);
        continue;
      }
      Ok(false) => continue,
      Ok(true)  => {
        top_half(&pipeline);
      }
    }
    if let Err(err) = line.unmask() {
      error!("Unable to re-arm the interrupt! {}", err);
    }
  }
  info!("Interrupt listener stopped");
}
