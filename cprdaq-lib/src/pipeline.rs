//! The driver context
//!
//! One `Pipeline` is created when the driver is loaded.
//! It owns the DMA buffers, the event queue, the DMA
//! engine and the run state, all behind one lock (the
//! data lock). A second lock serializes the executions
//! of the interrupt bottom half.
//!
//! The run control operations of the data node live
//! here as well.

use std::fmt;
use std::sync::{
  Arc,
  Condvar,
  Mutex,
  MutexGuard,
};
use std::sync::atomic::{
  AtomicU64,
  Ordering,
};
use std::time::Duration;

use crossbeam_channel::{
  Receiver,
  Sender,
  TrySendError,
};

use crate::control;
use crate::dma_buffer::DmaBufferPool;
use crate::dma_engine::{
  DmaEngine,
  DmaStart,
};
use crate::errors::BridgeError;
use crate::event_queue::EventQueue;
use crate::memory::RegisterBridge;
use crate::run::{
  ModuleIdentity,
  RunState,
};
use crate::settings::DriverSettings;

/// What the bottom half has been up to
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct WorkerCounters {
  pub bottom_halves : u64,
  pub local_ints    : u64,
  pub dma_done      : u64,
}

/// Everything behind the data lock
pub struct PipelineState {
  pub pool     : DmaBufferPool,
  pub queue    : EventQueue,
  pub engine   : DmaEngine,
  pub run      : RunState,
  pub identity : ModuleIdentity,
  pub counters : WorkerCounters,
}

impl PipelineState {
  /// Start the next transfer
  pub fn try_start(&mut self, bridge : &dyn RegisterBridge) -> DmaStart {
    let PipelineState {pool, queue, engine, run, ..} = self;
    engine.try_start(bridge, pool, queue, run)
  }

  /// Frame the transfer in flight
  pub fn complete_transfer(&mut self) -> Option<usize> {
    let PipelineState {pool, queue, engine, ..} = self;
    engine.complete(pool, queue)
  }

  /// Forget all events and transfers, keep the memory
  pub fn clear_buffers(&mut self) {
    self.queue.clear();
    self.pool.clear();
    self.engine.clear();
  }
}

pub struct Pipeline {
  bridge          : Arc<dyn RegisterBridge>,
  state           : Mutex<PipelineState>,
  /// Readers wait on this for new events or end_run
  readable        : Condvar,
  /// Held for one execution of the bottom half
  irq_lock        : Mutex<()>,
  work_tx         : Sender<()>,
  work_rx         : Receiver<()>,
  /// Interrupts claimed by the top half
  n_interrupts    : AtomicU64,
  /// Interrupts without an active source
  n_bogus         : AtomicU64,
  lef_almost_full : u32,
}

impl Pipeline {
  /// Allocate the DMA buffers and the event queue
  pub fn new(bridge   : Arc<dyn RegisterBridge>,
             settings : &DriverSettings) -> Result<Self, BridgeError> {
    let pool = DmaBufferPool::allocate(&settings.dma_source,
                                       settings.n_dma_buffers,
                                       settings.dma_buffer_size())?;
    Ok(Self::with_pool(bridge, pool, settings))
  }

  /// Use DMA buffers which are already there
  pub fn with_pool(bridge   : Arc<dyn RegisterBridge>,
                   pool     : DmaBufferPool,
                   settings : &DriverSettings) -> Self {
    let state = PipelineState {
      pool,
      queue    : EventQueue::with_limit(settings.queue_allotment, settings.queue_limit()),
      engine   : DmaEngine::with_limits(settings.abort_retries, settings.lost_intr_limit),
      run      : RunState::new(),
      identity : settings.module,
      counters : WorkerCounters::default(),
    };
    // one pending work item is enough, like queue_work
    let (work_tx, work_rx) = crossbeam_channel::bounded::<()>(1);
    Self {
      bridge,
      state           : Mutex::new(state),
      readable        : Condvar::new(),
      irq_lock        : Mutex::new(()),
      work_tx,
      work_rx,
      n_interrupts    : AtomicU64::new(0),
      n_bogus         : AtomicU64::new(0),
      lef_almost_full : settings.lef_almost_full,
    }
  }

  pub fn bridge(&self) -> &dyn RegisterBridge {
    self.bridge.as_ref()
  }

  /// Take the data lock
  pub fn lock(&self) -> MutexGuard<'_, PipelineState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        error!("Data lock poisoned, continuing anyway!");
        poisoned.into_inner()
      }
    }
  }

  /// Take the bottom half lock
  pub fn irq_lock(&self) -> MutexGuard<'_, ()> {
    match self.irq_lock.lock() {
      Ok(guard)     => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Wait for a wake up of the readers. Spurious
  /// wake ups are possible, check the condition.
  pub fn wait_readable<'a>(&self,
                           guard   : MutexGuard<'a, PipelineState>,
                           timeout : Duration) -> MutexGuard<'a, PipelineState> {
    match self.readable.wait_timeout(guard, timeout) {
      Ok((guard, _))  => guard,
      Err(poisoned)   => poisoned.into_inner().0,
    }
  }

  /// There might be something new for the readers
  pub fn wake_readers(&self) {
    self.readable.notify_all();
  }

  /// Ask for the bottom half. If one is already
  /// pending, this is a no-op.
  pub fn schedule_work(&self) -> bool {
    match self.work_tx.try_send(()) {
      Ok(_) => true,
      Err(TrySendError::Full(_)) => false,
      Err(TrySendError::Disconnected(_)) => {
        error!("Work channel disconnected!");
        false
      }
    }
  }

  pub fn work_receiver(&self) -> Receiver<()> {
    self.work_rx.clone()
  }

  pub fn count_interrupt(&self, bogus : bool) {
    self.n_interrupts.fetch_add(1, Ordering::Relaxed);
    if bogus {
      self.n_bogus.fetch_add(1, Ordering::Relaxed);
    }
  }

  //========== run control ===========

  /// Pulse the FINESSE reset
  pub fn reset_finesse(&self) {
    control::reset_finesse(self.bridge());
  }

  /// Clear the event FIFO, back to the default read mode
  pub fn reset_copper(&self) {
    info!("Resetting COPPER FIFOs");
    control::reset_copper(self.bridge());
  }

  /// Start over, without giving back any memory
  pub fn init_run(&self) {
    let bridge = self.bridge();
    control::reset_copper(bridge);
    control::enable_copper_intr(bridge);
    {
      let mut state = self.lock();
      state.run.clear();
      state.clear_buffers();
      state.counters = WorkerCounters::default();
      control::clear_dma_error(bridge);
    }
    self.n_interrupts.store(0, Ordering::Relaxed);
    self.n_bogus.store(0, Ordering::Relaxed);
    info!("Run initialized");
    self.wake_readers();
  }

  /// Try to start a transfer right now, e.g. when
  /// the reader did not see anything for a while
  pub fn force_dma(&self) -> DmaStart {
    let result = {
      let mut state = self.lock();
      state.try_start(self.bridge())
    };
    debug!("force_dma {}", result);
    result
  }

  /// No new transfers, readers get EOF once
  /// everything queued is read
  pub fn end_run(&self) {
    {
      let mut state = self.lock();
      state.run.end_run = true;
      info!("End of run requested after {} events", state.run.event_number);
    }
    self.wake_readers();
  }

  pub fn set_module_identity(&self, identity : ModuleIdentity) {
    self.lock().identity = identity;
  }

  pub fn set_subsys(&self, subsys : u32) {
    self.lock().identity.subsys = subsys;
  }

  pub fn set_crate(&self, crate_ : u32) {
    self.lock().identity.crate_ = crate_;
  }

  pub fn set_slot(&self, slot : u32) {
    self.lock().identity.slot = slot;
  }

  pub fn module_identity(&self) -> ModuleIdentity {
    self.lock().identity
  }

  pub fn enable_interrupts(&self) {
    control::enable_interrupts(self.bridge());
  }

  pub fn disable_interrupts(&self) {
    control::disable_interrupts(self.bridge());
  }

  /// Drop queued events and buffer content,
  /// clear the DMA error state
  pub fn clear_dma(&self) {
    {
      let mut state = self.lock();
      state.clear_buffers();
      // an event half way out is gone
      state.run.epoch += 1;
      control::clear_dma_error(self.bridge());
    }
    self.wake_readers();
  }

  /// Stop a transfer in flight (bounded)
  pub fn abort_dma(&self) -> bool {
    self.lock().engine.abort(self.bridge())
  }

  /// FIFO thresholds matching the DMA buffer size
  pub fn config_event_fifo_depth(&self) {
    let capacity = self.lock().pool.capacity();
    control::config_event_fifo_depth(self.bridge(), capacity, self.lef_almost_full);
  }

  /// A snapshot of the diagnostic counters
  pub fn status(&self) -> BufferStatus {
    let state = self.lock();
    BufferStatus {
      write_positions : state.pool.write_positions(),
      in_use          : state.pool.in_use(),
      wbuf            : state.pool.write_buffer(),
      rbuf            : state.pool.read_buffer(),
      queue_count     : state.queue.count(),
      queue_empty     : state.queue.empty_count(),
      queue_capacity  : state.queue.capacity(),
      dma_active      : state.engine.is_active(),
      next_dma_size   : state.engine.next_dma_size(),
      buffer_full     : state.engine.buffer_full,
      n_buffer_full   : state.engine.n_buffer_full,
      lost_intr       : state.engine.lost_intr,
      found_lost_intr : state.engine.found_lost_intr,
      lost_words      : state.engine.lost_words,
      fifo_full       : state.run.fifo_full,
      too_much        : state.run.too_much,
      end_run         : state.run.end_run,
      event_number    : state.run.event_number,
      dma_count       : state.run.dma_count,
      dma_try_count   : state.run.dma_try_count,
      interrupts      : self.n_interrupts.load(Ordering::Relaxed),
      bogus           : self.n_bogus.load(Ordering::Relaxed),
      bottom_halves   : state.counters.bottom_halves,
      local_ints      : state.counters.local_ints,
      dma_done        : state.counters.dma_done,
    }
  }
}

/// Diagnostics of the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct BufferStatus {
  pub write_positions : Vec<usize>,
  pub in_use          : Vec<usize>,
  pub wbuf            : usize,
  pub rbuf            : usize,
  pub queue_count     : usize,
  pub queue_empty     : usize,
  pub queue_capacity  : usize,
  pub dma_active      : bool,
  pub next_dma_size   : Option<usize>,
  pub buffer_full     : bool,
  pub n_buffer_full   : u64,
  pub lost_intr       : u32,
  pub found_lost_intr : u32,
  pub lost_words      : u64,
  pub fifo_full       : bool,
  pub too_much        : bool,
  pub end_run         : bool,
  pub event_number    : u32,
  pub dma_count       : u64,
  pub dma_try_count   : u64,
  pub interrupts      : u64,
  pub bogus           : u64,
  pub bottom_halves   : u64,
  pub local_ints      : u64,
  pub dma_done        : u64,
}

impl fmt::Display for BufferStatus {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<BufferStatus:");
    repr += &(format!("\n  wpos              : {:?}", self.write_positions));
    repr += &(format!("\n  in_use            : {:?}", self.in_use));
    repr += &(format!("\n  wbuf/rbuf         : {}/{}", self.wbuf, self.rbuf));
    repr += &(format!("\n  queue             : {} ready, {} empty ({} slots)",
                      self.queue_count, self.queue_empty, self.queue_capacity));
    repr += &(format!("\n  dma active        : {}", self.dma_active));
    repr += &(format!("\n  next dma size     : {:?}", self.next_dma_size));
    repr += &(format!("\n  buffer full       : {} ({} times)", self.buffer_full, self.n_buffer_full));
    repr += &(format!("\n  lost/found intr   : {}/{}", self.lost_intr, self.found_lost_intr));
    repr += &(format!("\n  lost words        : {}", self.lost_words));
    repr += &(format!("\n  fifo_full         : {}", self.fifo_full));
    repr += &(format!("\n  too_much          : {}", self.too_much));
    repr += &(format!("\n  end_run           : {}", self.end_run));
    repr += &(format!("\n  event number      : {}", self.event_number));
    repr += &(format!("\n  dma (tries)       : {} ({})", self.dma_count, self.dma_try_count));
    repr += &(format!("\n  interrupts (bogus): {} ({})", self.interrupts, self.bogus));
    repr += &(format!("\n  bottom halves     : {}", self.bottom_halves));
    repr += &(format!("\n  local/dma done    : {}/{}>", self.local_ints, self.dma_done));
    write!(f, "{}", repr)
  }
}

#[cfg(test)]
mod test_pipeline {
  use super::*;
  use crate::sim::SimulatedCopper;

  fn pipeline() -> (Arc<SimulatedCopper>, Pipeline) {
    let sim = Arc::new(SimulatedCopper::new());
    let mut settings = DriverSettings::new();
    settings.dma_pages       = 0;
    settings.queue_allotment = 16;
    let pipeline = Pipeline::new(sim.clone(), &settings).unwrap();
    sim.map_windows(pipeline.lock().pool.windows());
    (sim, pipeline)
  }

  #[test]
  fn force_dma_frames() {
    let (sim, p) = pipeline();
    sim.push_record([1, 0, 0, 0], &[42]);
    assert_eq!(p.force_dma(), DmaStart::Started(32));
    // the sim finished right away
    assert_eq!(p.lock().complete_transfer(), Some(1));
    assert_eq!(p.status().queue_count, 1);
  }

  #[test]
  fn init_run_resets() {
    let (sim, p) = pipeline();
    sim.push_record([1, 0, 0, 0], &[42]);
    p.force_dma();
    p.lock().complete_transfer();
    p.end_run();
    let epoch = p.lock().run.epoch;
    p.init_run();
    let status = p.status();
    assert_eq!(status.queue_count, 0);
    assert_eq!(status.write_positions, vec![0; 4]);
    assert!(!status.end_run);
    assert!(!status.dma_active);
    assert_eq!(p.lock().run.epoch, epoch + 1);
    assert_eq!(sim.read_reg32(crate::memory::RegisterBlock::Copper, crate::registers::INT_MASK), 7);
  }

  #[test]
  fn work_is_not_duplicated() {
    let (_sim, p) = pipeline();
    assert!(p.schedule_work());
    assert!(!p.schedule_work());
    assert!(p.work_receiver().try_recv().is_ok());
    assert!(p.schedule_work());
  }

  #[test]
  fn identity() {
    let (_sim, p) = pipeline();
    p.set_subsys(1);
    p.set_crate(2);
    p.set_slot(3);
    assert_eq!(p.module_identity(), ModuleIdentity::new(1, 2, 3));
  }

  #[test]
  fn no_transfer_after_end_run() {
    let (sim, p) = pipeline();
    sim.push_record([1, 0, 0, 0], &[42]);
    p.end_run();
    assert_eq!(p.force_dma(), DmaStart::RunEnded);
  }
}
