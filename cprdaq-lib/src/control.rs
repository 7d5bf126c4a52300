//! Convenience functions to read/write
//!  the various control registers
//!
//!  For the mapping of registers/addresses,
//!  see `registers.rs`
//!

use crate::memory::{
  RegisterBlock,
  RegisterBridge,
};
use crate::registers::*;

use RegisterBlock::{
  Copper,
  Plx9054,
};

fn set_intcsr_bits(bridge : &dyn RegisterBridge, bits : u32) {
  let value = bridge.read_reg32(Plx9054, INTCSR);
  bridge.write_reg32(Plx9054, INTCSR, value | bits);
}

fn clear_intcsr_bits(bridge : &dyn RegisterBridge, bits : u32) {
  let value = bridge.read_reg32(Plx9054, INTCSR);
  bridge.write_reg32(Plx9054, INTCSR, value & !bits);
}

/// Let the bridge raise interrupts on the PCI bus
pub fn enable_pci_intr(bridge : &dyn RegisterBridge) {
  set_intcsr_bits(bridge, INTCSR_PCI_INT_ENABLE);
}

pub fn disable_pci_intr(bridge : &dyn RegisterBridge) {
  clear_intcsr_bits(bridge, INTCSR_PCI_INT_ENABLE);
}

/// Forward the local (COPPER) interrupt input
pub fn enable_local_intr(bridge : &dyn RegisterBridge) {
  set_intcsr_bits(bridge, INTCSR_LOCAL_INT_ENABLE);
  trace!("enable_local_intr set INTCSR = {:08x}", bridge.read_reg32(Plx9054, INTCSR));
}

pub fn disable_local_intr(bridge : &dyn RegisterBridge) {
  clear_intcsr_bits(bridge, INTCSR_LOCAL_INT_ENABLE);
  trace!("disable_local_intr set INTCSR = {:08x}", bridge.read_reg32(Plx9054, INTCSR));
}

/// Enable the COPPER interrupt sources
///
/// * event fifo almost full
/// * length fifo almost full
/// * length fifo threshold
pub fn enable_copper_intr(bridge : &dyn RegisterBridge) {
  bridge.write_reg32(Copper, INT_MASK, INT_ALL);
}

pub fn disable_copper_intr(bridge : &dyn RegisterBridge) {
  bridge.write_reg32(Copper, INT_MASK, 0);
}

/// Pulse the FINESSE reset line
pub fn reset_finesse(bridge : &dyn RegisterBridge) {
  info!("Resetting FINESSE!");
  bridge.write_reg32(Copper, FF_RST, FF_RST_FINESSE);
  bridge.write_reg32(Copper, FF_RST, 0);
}

/// Throw away everything in the event FIFOs
pub fn clear_copper_fifo(bridge : &dyn RegisterBridge) {
  bridge.write_reg32(Copper, FF_RST, FF_RST_CLEAR_FIFOS);
  bridge.write_reg32(Copper, FF_RST, 0);
}

/// Use LEF_TOTAL instead of LEF_AB/LEF_CD and forbid
/// single word access to the data FIFO, the DMA
/// engine is the only one reading it
pub fn set_fifo_read_mode(bridge : &dyn RegisterBridge) {
  bridge.write_reg32(Copper, LEF_READSEL, 1);
  bridge.write_reg32(Copper, FF_RW, 0);
}

/// Clear FIFOs and restore the default read mode
pub fn reset_copper(bridge : &dyn RegisterBridge) {
  clear_copper_fifo(bridge);
  set_fifo_read_mode(bridge);
}

/// Set the event FIFO thresholds, so that the
/// content of all 4 FIFOs fits in one DMA buffer
///
/// # Arguments
///
/// * buffer_size     : size of one DMA buffer in bytes
/// * lef_almost_full : length FIFO almost full threshold
pub fn config_event_fifo_depth(bridge          : &dyn RegisterBridge,
                               buffer_size     : usize,
                               lef_almost_full : u32) {
  let full  = ((buffer_size / (4*4)) * 3 / 4) as u32;
  let quant = full / 2;
  for reg in [CONF_WA_FF, CONF_WB_FF, CONF_WC_FF, CONF_WD_FF] {
    bridge.write_reg32(Copper, reg, quant);
  }
  for reg in [CONF_WA_AF, CONF_WB_AF, CONF_WC_AF, CONF_WD_AF] {
    bridge.write_reg32(Copper, reg, full);
  }
  debug!("LEF_WX_FF: {} {} {} {}",
         bridge.read_reg32(Copper, LEF_WA_FF),
         bridge.read_reg32(Copper, LEF_WB_FF),
         bridge.read_reg32(Copper, LEF_WC_FF),
         bridge.read_reg32(Copper, LEF_WD_FF));
  for reg in [LEF_WA_AF, LEF_WB_AF, LEF_WC_AF, LEF_WD_AF] {
    bridge.write_reg32(Copper, reg, lef_almost_full);
  }
}

/// Clear DMA0 status and a pending PCI error
pub fn clear_dma_error(bridge : &dyn RegisterBridge) {
  bridge.write_reg32(Plx9054, DMACSR0, DMACSR_CLEAR_INT);
  set_intcsr_bits(bridge, INTCSR_PCI_ERROR);
}

/// Check the DMA0 done bit
pub fn dma_done(bridge : &dyn RegisterBridge) -> bool {
  (bridge.read_reg32(Plx9054, DMACSR0) & DMACSR_DONE) > 0
}

/// Abort DMA channel 0 (data book section 3.5.4.1)
///
/// When DMA0 is aborted succesfully, the done bit
/// becomes 1. Returns if that was seen within
/// `retries` reads of DMACSR0.
pub fn abort_dma0(bridge : &dyn RegisterBridge, retries : usize) -> bool {
  bridge.write_reg32(Plx9054, DMACSR0, DMACSR_ABORT);
  for k in 0..retries {
    let dmacsr = bridge.read_reg32(Plx9054, DMACSR0);
    trace!("{} DMACSR0 {:08x}", k, dmacsr);
    if dmacsr & DMACSR_DONE > 0 {
      return true;
    }
  }
  false
}

/// Program DMA channel 0 to move `size` bytes out of
/// the event FIFO to `bus_addr` and start it.
///
/// This also makes sure we hear about the
/// completion (DMA0 and PCI interrupt enable).
pub fn start_dma0(bridge : &dyn RegisterBridge, bus_addr : u64, size : usize) {
  bridge.write_reg32(Plx9054, DMAMODE0, DMAMODE0_FIFO_TO_PCI);
  bridge.write_reg32(Plx9054, DMAPADR0, (bus_addr & 0xffffffff) as u32);
  bridge.write_reg32(Plx9054, DMADAC0,  (bus_addr >> 32) as u32);
  bridge.write_reg32(Plx9054, DMALADR0, FF_DMA);
  bridge.write_reg32(Plx9054, DMASIZ0,  size as u32);
  bridge.write_reg32(Plx9054, DMADPR0,  DMADPR0_LOCAL_TO_PCI);
  bridge.write_reg32(Plx9054, DMACSR0,  DMACSR_ENABLE | DMACSR_START);
  let intcsr = bridge.read_reg32(Plx9054, INTCSR);
  let intcsr = (intcsr | INTCSR_DMA0_INT_ENABLE | INTCSR_PCI_INT_ENABLE) & !INTCSR_PCI_ERROR;
  bridge.write_reg32(Plx9054, INTCSR, intcsr);
}

/// Size of the next event in words, as
/// announced by the length FIFOs
pub fn get_lef_total(bridge : &dyn RegisterBridge) -> u32 {
  bridge.read_reg32(Copper, LEF_TOTAL)
}

/// Pending COPPER interrupt sources
pub fn get_int_sta(bridge : &dyn RegisterBridge) -> u32 {
  bridge.read_reg32(Copper, INT_STA)
}

/// Check the FIFO full bit of all FINESSE
pub fn get_fifo_full(bridge : &dyn RegisterBridge) -> bool {
  bridge.read_reg32(Copper, FF_STA) & FF_STA_FULL_MASK != 0
}

/// LEF_STA bits of the FINESSE slots which are
/// actually equipped
pub fn get_pending_finesse(bridge : &dyn RegisterBridge) -> u32 {
  let lef_sta     = bridge.read_reg32(Copper, LEF_STA);
  let finesse_sta = bridge.read_reg32(Copper, FINESSE_STA);
  let mut mask    = 0u32;
  for k in 0..4 {
    if finesse_sta & (1 << k) > 0 {
      mask |= 1 << (4*k);
    }
  }
  lef_sta & mask
}

/// Switch all three interrupt paths on
pub fn enable_interrupts(bridge : &dyn RegisterBridge) {
  enable_copper_intr(bridge);
  enable_pci_intr(bridge);
  enable_local_intr(bridge);
}

/// Switch all three interrupt paths off
pub fn disable_interrupts(bridge : &dyn RegisterBridge) {
  disable_copper_intr(bridge);
  disable_pci_intr(bridge);
  disable_local_intr(bridge);
}
