//! Decide when and where the next DMA transfer goes
//!
//! At most one transfer is in flight. Its destination is
//! reserved in the buffer ring when it is started, and
//! framed when it is done.
//!
//! The engine itself does not lock anything, it is part
//! of the pipeline state.

use std::fmt;

use crate::control::{
  abort_dma0,
  clear_dma_error,
  dma_done,
  get_fifo_full,
  get_lef_total,
  get_pending_finesse,
  start_dma0,
};
use crate::constants::{
  SIZEOF_U32,
  DEFAULT_ABORT_RETRIES,
  DEFAULT_LOST_INTR_LIMIT,
};
use crate::dma_buffer::{
  BufferId,
  DmaBufferPool,
};
use crate::errors::{
  PoolError,
  QueueError,
};
use crate::event_queue::EventQueue;
use crate::framer;
use crate::memory::RegisterBridge;
use crate::registers::INTCSR_DMA0_INT_ACTIVE;
use crate::run::RunState;

/// What came out of an attempt to start a transfer
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DmaStart {
  /// A transfer of this many bytes is in flight
  Started(usize),
  /// The length FIFO does not announce anything
  NoEventAvailable,
  /// No space in the buffer ring, need the reader first
  BufferFull,
  /// The event does not even fit into an empty buffer
  Oversize,
  /// The previous transfer is not done yet
  AlreadyActive,
  /// end_run was requested, no new transfers
  RunEnded,
}

impl fmt::Display for DmaStart {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      DmaStart::Started(size)   => write!(f, "<DmaStart: Started({})>", size),
      DmaStart::NoEventAvailable => write!(f, "<DmaStart: NoEventAvailable>"),
      DmaStart::BufferFull       => write!(f, "<DmaStart: BufferFull>"),
      DmaStart::Oversize         => write!(f, "<DmaStart: Oversize>"),
      DmaStart::AlreadyActive    => write!(f, "<DmaStart: AlreadyActive>"),
      DmaStart::RunEnded         => write!(f, "<DmaStart: RunEnded>"),
    }
  }
}

/// The transfer the bridge is working on
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct InFlight {
  pub buffer : BufferId,
  /// byte offset within the buffer
  pub offset : usize,
  /// bytes
  pub size   : usize,
}

pub struct DmaEngine {
  in_flight         : Option<InFlight>,
  /// Bytes of the next event, as read from
  /// LEF_TOTAL and not yet transferred
  next_dma_size     : Option<usize>,
  /// The ring is full, the reader has to retry
  pub buffer_full   : bool,
  /// How often we ran into a full ring
  pub n_buffer_full : u64,
  pub lost_intr     : u32,
  pub found_lost_intr : u32,
  pub lost_intr_limit : u32,
  pub abort_retries : usize,
  /// Words dropped by the framing
  pub lost_words    : u64,
  /// Transfers which were framed
  pub n_completed   : u64,
  /// Events framed in total
  pub n_framed      : u64,
}

impl DmaEngine {
  pub fn new() -> Self {
    Self::with_limits(DEFAULT_ABORT_RETRIES, DEFAULT_LOST_INTR_LIMIT)
  }

  pub fn with_limits(abort_retries : usize, lost_intr_limit : u32) -> Self {
    Self {
      in_flight       : None,
      next_dma_size   : None,
      buffer_full     : false,
      n_buffer_full   : 0,
      lost_intr       : 0,
      found_lost_intr : 0,
      lost_intr_limit,
      abort_retries,
      lost_words      : 0,
      n_completed     : 0,
      n_framed        : 0,
    }
  }

  pub fn is_active(&self) -> bool {
    self.in_flight.is_some()
  }

  pub fn in_flight(&self) -> Option<InFlight> {
    self.in_flight
  }

  pub fn next_dma_size(&self) -> Option<usize> {
    self.next_dma_size
  }

  pub fn clear_next_dma_size(&mut self) {
    self.next_dma_size = None;
  }

  /// Back to the state after load, keeps the limits
  pub fn clear(&mut self) {
    self.in_flight       = None;
    self.next_dma_size   = None;
    self.buffer_full     = false;
    self.n_buffer_full   = 0;
    self.lost_intr       = 0;
    self.found_lost_intr = 0;
    self.lost_words      = 0;
    self.n_completed     = 0;
    self.n_framed        = 0;
  }

  /// Size of the next event in bytes
  ///
  /// The length FIFO is popped by the hardware when the
  /// event is moved, so the value is kept until a transfer
  /// for it got started.
  fn fetch_next_dma_size(&mut self, bridge : &dyn RegisterBridge) -> usize {
    if let Some(size) = self.next_dma_size {
      return size;
    }
    let pending = get_pending_finesse(bridge);
    if pending != 0 {
      trace!("no size cached, LEF_STA shows pending FINESSE {:#06x}", pending);
    }
    let size = get_lef_total(bridge) as usize * SIZEOF_U32;
    self.next_dma_size = Some(size);
    size
  }

  /// Start the next transfer, if there is one and
  /// there is space for it.
  pub fn try_start(&mut self,
                   bridge : &dyn RegisterBridge,
                   pool   : &mut DmaBufferPool,
                   queue  : &mut EventQueue,
                   run    : &mut RunState) -> DmaStart {
    if run.end_run {
      debug!("try_start is called, but this run is terminated");
      return DmaStart::RunEnded;
    }
    if self.in_flight.is_some() {
      if !dma_done(bridge) {
        trace!("try_start is called, but DMA is active");
        return DmaStart::AlreadyActive;
      }
      warn!("DMA is marked as active, but DMACSR0 shows it was done (dmac={})!", run.dma_count);
      self.complete(pool, queue);
    }
    run.dma_try_count += 1;
    clear_dma_error(bridge);

    if !run.fifo_full && get_fifo_full(bridge) {
      error!("FIFO FULL happened, following data will be corrupted (eventno = {})!", run.event_number);
      run.fifo_full = true;
    }

    let size = self.fetch_next_dma_size(bridge);
    if !run.too_much && size > pool.capacity() {
      error!("Event of {} bytes is too long for a DMA buffer of {} bytes! Last event# {}",
             size, pool.capacity(), run.event_number);
      run.too_much = true;
    }
    if size == 0 {
      debug!("dmac={} LEF_TOTAL=0", run.dma_count);
      self.next_dma_size = None;
      return DmaStart::NoEventAvailable;
    }

    let id = match pool.find_write_target(size) {
      Err(err) => {
        if !self.buffer_full {
          debug!("Can not allocate {} bytes for DMA! {}", size, err);
        }
        self.buffer_full    = true;
        self.n_buffer_full += 1;
        trace!("dmac={} {}", run.dma_count, pool);
        return match err {
          PoolError::BufferFull       => DmaStart::BufferFull,
          PoolError::OversizeTransfer => DmaStart::Oversize,
        };
      }
      Ok(id) => id
    };
    self.buffer_full   = false;
    self.next_dma_size = None;
    let offset   = pool.record_transfer(id, size);
    let bus_addr = pool.buffer(id).memory.bus_addr() + offset as u64;
    debug!("#={} buf[{}] offset={} size={}", run.event_number, id, offset, size);
    self.in_flight = Some(InFlight {
      buffer : id,
      offset,
      size,
    });
    start_dma0(bridge, bus_addr, size);
    run.dma_count += 1;
    DmaStart::Started(size)
  }

  /// Frame the transfer which just finished and queue
  /// its events. Returns the number of events queued,
  /// or None if there was nothing in flight.
  pub fn complete(&mut self,
                  pool  : &mut DmaBufferPool,
                  queue : &mut EventQueue) -> Option<usize> {
    let transfer = self.in_flight.take()?;
    let framed   = {
      let region = pool.buffer(transfer.buffer).memory.region(transfer.offset, transfer.size);
      framer::scan(region, transfer.buffer, transfer.offset)
    };
    let mut n_queued   = 0usize;
    let mut lost_words = framed.lost_words;
    for desc in framed.events.iter() {
      match queue.enqueue(*desc) {
        Ok(_) => n_queued += 1,
        Err(QueueError::QueueOverflow) => {
          let unqueued : usize = framed.events[n_queued..].iter().map(|d| d.len).sum();
          lost_words += unqueued / SIZEOF_U32;
          error!("Event queue overflow, {} events in buffer {} are lost!",
                 framed.events.len() - n_queued, transfer.buffer);
          break;
        }
        Err(err) => {
          error!("Unexpected queue error {}", err);
          break;
        }
      }
    }
    pool.add_events(transfer.buffer, n_queued);
    self.lost_words  += lost_words as u64;
    self.n_completed += 1;
    self.n_framed    += n_queued as u64;
    trace!("event_count = {}", queue.count());
    Some(n_queued)
  }

  /// Stop the transfer in flight
  ///
  /// Gives up after abort_retries reads of the status
  /// register. Returns false if the bridge never
  /// confirmed the abort.
  pub fn abort(&mut self, bridge : &dyn RegisterBridge) -> bool {
    if dma_done(bridge) {
      self.in_flight = None;
      return true;
    }
    warn!("DMA is active, aborting...");
    let confirmed = abort_dma0(bridge, self.abort_retries);
    if !confirmed {
      error!("DMA0 did not confirm the abort after {} polls!", self.abort_retries);
    }
    self.in_flight = None;
    confirmed
  }

  /// A transfer is in flight and done, but the interrupt
  /// status does not show it. Returns true if this
  /// looks like a lost interrupt.
  pub fn check_lost_interrupt(&mut self,
                              bridge : &dyn RegisterBridge,
                              intcsr : u32) -> bool {
    if self.lost_intr < self.lost_intr_limit
      && self.in_flight.is_some()
      && intcsr & INTCSR_DMA0_INT_ACTIVE == 0
      && dma_done(bridge) {
      self.lost_intr += 1;
      warn!("Maybe lost DMA done interrupt ({} so far)", self.lost_intr);
      return true;
    }
    false
  }

  /// A DMA done interrupt arrived
  pub fn note_dma_interrupt(&mut self) {
    if self.lost_intr > 0 {
      self.found_lost_intr += 1;
      debug!("Found lost DMA done interrupt ({} so far)", self.found_lost_intr);
    }
  }
}

impl Default for DmaEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for DmaEngine {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<DmaEngine:");
    repr += &(format!("\n  in flight     : {:?}", self.in_flight));
    repr += &(format!("\n  next size     : {:?}", self.next_dma_size));
    repr += &(format!("\n  buffer_full   : {} ({} times)", self.buffer_full, self.n_buffer_full));
    repr += &(format!("\n  lost/found    : {}/{}", self.lost_intr, self.found_lost_intr));
    repr += &(format!("\n  completed     : {}", self.n_completed));
    repr += &(format!("\n  framed        : {}", self.n_framed));
    repr += &(format!("\n  lost words    : {}>", self.lost_words));
    write!(f, "{}", repr)
  }
}
