//! A software COPPER behind a software PLX9054
//!
//! Good enough to run the whole pipeline without the
//! board: the event FIFO and the length FIFO, the
//! interrupt status/mask registers, the INTCSR/DMACSR0
//! semantics of the bridge, and a bus master which
//! copies the FIFO content into the DMA buffers.
//!
//! A transfer is either carried out right away when it
//! is started, or held until `release_dma` is called, so
//! that in-flight transfers can be observed.
//!
//! The interrupt line is level triggered and behaves
//! like UIO: once `wait_asserted` returned true, it is
//! masked until `unmask`.

use std::collections::VecDeque;
use std::sync::{
  Condvar,
  Mutex,
  MutexGuard,
};
use std::time::{
  Duration,
  Instant,
};

use crate::constants::N_FINESSE;
use crate::errors::BridgeError;
use crate::framer::build_record;
use crate::memory::{
  DmaWindow,
  InterruptLine,
  RegisterBlock,
  RegisterBridge,
};
use crate::registers::*;

/// A transfer the bus master was told to do
#[derive(Debug, Copy, Clone, PartialEq)]
struct Transfer {
  bus_addr : u64,
  size     : usize,
}

struct SimState {
  plx9054     : Vec<u32>,
  copper      : Vec<u32>,
  event_fifo  : VecDeque<u32>,
  /// words of each pending event
  length_fifo : VecDeque<u32>,
  fifo_full   : bool,
  dma_done    : bool,
  hold_dma    : bool,
  /// an abort never gets confirmed
  abort_stuck : bool,
  held        : Option<Transfer>,
  windows     : Vec<DmaWindow>,
  /// UIO style masking of the line
  masked      : bool,
  n_transfers : u64,
  n_csr_reads : u64,
}

impl SimState {
  fn new() -> Self {
    let mut copper = vec![0u32; COPPER_REGSIZE/4];
    copper[(FINESSE_STA/4) as usize] = 0xf;
    Self {
      plx9054     : vec![0u32; PLX9054_REGSIZE/4],
      copper,
      event_fifo  : VecDeque::new(),
      length_fifo : VecDeque::new(),
      fifo_full   : false,
      dma_done    : false,
      hold_dma    : false,
      abort_stuck : false,
      held        : None,
      windows     : Vec::new(),
      masked      : false,
      n_transfers : 0,
      n_csr_reads : 0,
    }
  }

  fn plx(&self, offset : u32) -> u32 {
    self.plx9054.get((offset/4) as usize).copied().unwrap_or(0)
  }

  fn cpr(&self, offset : u32) -> u32 {
    self.copper.get((offset/4) as usize).copied().unwrap_or(0)
  }

  fn int_sta(&self) -> u32 {
    let mut sta = 0u32;
    if !self.length_fifo.is_empty() {
      sta |= INT_LENGTH_FIFO_THRESHOLD;
    }
    if self.fifo_full {
      sta |= INT_EVENT_FIFO_ALMOST_FULL;
    }
    sta
  }

  fn local_active(&self) -> bool {
    self.int_sta() & self.cpr(INT_MASK) != 0
      && self.plx(INTCSR) & INTCSR_LOCAL_INT_ENABLE != 0
  }

  fn dma0_active(&self) -> bool {
    self.dma_done && self.plx(INTCSR) & INTCSR_DMA0_INT_ENABLE != 0
  }

  fn intcsr(&self) -> u32 {
    let mut value = self.plx(INTCSR);
    if self.local_active() {
      value |= INTCSR_LOCAL_INT_ACTIVE;
    }
    if self.dma0_active() {
      value |= INTCSR_DMA0_INT_ACTIVE;
    }
    value
  }

  fn asserted(&self) -> bool {
    self.plx(INTCSR) & INTCSR_PCI_INT_ENABLE != 0
      && (self.local_active() || self.dma0_active())
  }

  fn read(&mut self, block : RegisterBlock, offset : u32) -> u32 {
    match block {
      RegisterBlock::Plx9054 => {
        match offset {
          INTCSR  => self.intcsr(),
          DMACSR0 => {
            self.n_csr_reads += 1;
            let mut value = self.plx(DMACSR0) & DMACSR_ENABLE;
            if self.dma_done {
              value |= DMACSR_DONE;
            }
            value
          }
          _ => self.plx(offset)
        }
      }
      RegisterBlock::Copper => {
        match offset {
          FF_STA    => if self.fifo_full { FF_STA_FULL_MASK } else { 0 },
          LEF_TOTAL => self.length_fifo.front().copied().unwrap_or(0),
          LEF_STA   => if self.length_fifo.is_empty() { 0 } else { 0x1 },
          INT_STA   => self.int_sta(),
          _         => self.cpr(offset)
        }
      }
    }
  }

  fn write(&mut self, block : RegisterBlock, offset : u32, value : u32) {
    let idx = (offset/4) as usize;
    match block {
      RegisterBlock::Plx9054 => {
        if idx >= self.plx9054.len() {
          return;
        }
        match offset {
          INTCSR => {
            // active bits are read only, the error bit is write 1 to clear
            let ro = INTCSR_LOCAL_INT_ACTIVE | INTCSR_DMA0_INT_ACTIVE | INTCSR_PCI_ERROR;
            self.plx9054[idx] = value & !ro;
          }
          DMACSR0 => self.write_dmacsr0(value),
          _ => self.plx9054[idx] = value
        }
      }
      RegisterBlock::Copper => {
        if idx >= self.copper.len() {
          return;
        }
        if offset == FF_RST && value & FF_RST_CLEAR_FIFOS != 0 {
          self.event_fifo.clear();
          self.length_fifo.clear();
          self.fifo_full = false;
        }
        self.copper[idx] = value;
      }
    }
  }

  fn write_dmacsr0(&mut self, value : u32) {
    let idx = (DMACSR0/4) as usize;
    self.plx9054[idx] = value & DMACSR_ENABLE;
    if value & DMACSR_CLEAR_INT != 0 {
      self.dma_done = false;
    }
    if value & DMACSR_ABORT != 0 {
      if self.abort_stuck {
        debug!("Abort ignored");
      } else {
        if self.held.take().is_some() {
          debug!("Held transfer aborted");
        }
        self.dma_done = true;
      }
    }
    if value & DMACSR_START != 0 && value & DMACSR_ENABLE != 0 {
      let bus_addr = self.plx(DMAPADR0) as u64 | ((self.plx(DMADAC0) as u64) << 32);
      let transfer = Transfer {
        bus_addr,
        size : self.plx(DMASIZ0) as usize,
      };
      self.dma_done = false;
      if self.hold_dma {
        self.held = Some(transfer);
      } else {
        self.transfer(transfer);
      }
    }
  }

  /// Move words out of the event FIFO to the bus
  fn transfer(&mut self, transfer : Transfer) {
    let n_words   = transfer.size / 4;
    let mut words = Vec::<u32>::with_capacity(n_words);
    for _ in 0..n_words {
      words.push(self.event_fifo.pop_front().unwrap_or(0));
    }
    let mut moved = n_words;
    while let Some(&n) = self.length_fifo.front() {
      if n as usize > moved {
        break;
      }
      moved -= n as usize;
      self.length_fifo.pop_front();
    }
    match self.windows.iter().find(|w| w.contains(transfer.bus_addr, transfer.size)) {
      Some(window) => {
        window.write_words(transfer.bus_addr, &words);
      }
      None => {
        error!("DMA to unmapped bus address {:#x} ({} bytes)!", transfer.bus_addr, transfer.size);
      }
    }
    self.n_transfers += 1;
    self.dma_done = true;
  }
}

pub struct SimulatedCopper {
  state : Mutex<SimState>,
  line  : Condvar,
}

impl SimulatedCopper {
  pub fn new() -> Self {
    Self {
      state : Mutex::new(SimState::new()),
      line  : Condvar::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, SimState> {
    match self.state.lock() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Tell the bus master where the DMA buffers are
  pub fn map_windows(&self, windows : Vec<DmaWindow>) {
    self.lock().windows = windows;
  }

  /// The FINESSE deliver an event (all words of
  /// one record)
  pub fn push_event(&self, words : &[u32]) {
    {
      let mut state = self.lock();
      state.event_fifo.extend(words.iter().copied());
      state.length_fifo.push_back(words.len() as u32);
    }
    self.line.notify_all();
  }

  /// Build and push a well formed record
  pub fn push_record(&self, sizes : [u32; N_FINESSE], payload : &[u32]) -> Vec<u32> {
    let words = build_record(sizes, payload);
    self.push_event(&words);
    words
  }

  pub fn set_fifo_full(&self, full : bool) {
    self.lock().fifo_full = full;
    self.line.notify_all();
  }

  /// Keep transfers in flight until `release_dma`
  pub fn set_hold_dma(&self, hold : bool) {
    self.lock().hold_dma = hold;
  }

  /// Carry out a held transfer. Returns false if
  /// there was none.
  pub fn release_dma(&self) -> bool {
    let released = {
      let mut state = self.lock();
      match state.held.take() {
        None    => false,
        Some(t) => {
          state.transfer(t);
          true
        }
      }
    };
    self.line.notify_all();
    released
  }

  /// The bridge ignores aborts, DONE stays clear
  pub fn set_abort_stuck(&self, stuck : bool) {
    self.lock().abort_stuck = stuck;
  }

  /// How often DMACSR0 was read
  pub fn dmacsr_reads(&self) -> u64 {
    self.lock().n_csr_reads
  }

  pub fn dma_held(&self) -> bool {
    self.lock().held.is_some()
  }

  /// Events still waiting in the length FIFO
  pub fn pending_events(&self) -> usize {
    self.lock().length_fifo.len()
  }

  pub fn n_transfers(&self) -> u64 {
    self.lock().n_transfers
  }

  pub fn interrupt_asserted(&self) -> bool {
    self.lock().asserted()
  }
}

impl Default for SimulatedCopper {
  fn default() -> Self {
    Self::new()
  }
}

impl RegisterBridge for SimulatedCopper {
  fn read_reg32(&self, block : RegisterBlock, offset : u32) -> u32 {
    self.lock().read(block, offset)
  }

  fn write_reg32(&self, block : RegisterBlock, offset : u32, value : u32) {
    self.lock().write(block, offset, value);
    self.line.notify_all();
  }
}

impl InterruptLine for SimulatedCopper {
  fn wait_asserted(&self, timeout : Duration) -> Result<bool, BridgeError> {
    let deadline  = Instant::now() + timeout;
    let mut state = self.lock();
    loop {
      if !state.masked && state.asserted() {
        state.masked = true;
        return Ok(true);
      }
      let now = Instant::now();
      if now >= deadline {
        return Ok(false);
      }
      state = match self.line.wait_timeout(state, deadline - now) {
        Ok((guard, _))  => guard,
        Err(poisoned)   => poisoned.into_inner().0,
      };
    }
  }

  fn unmask(&self) -> Result<(), BridgeError> {
    self.lock().masked = false;
    self.line.notify_all();
    Ok(())
  }
}
