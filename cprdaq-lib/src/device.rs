//! The character device nodes
//!
//! A `Driver` is what a loaded kernel module would be:
//! it owns the pipeline and the two threads which deal
//! with the interrupts. User space gets to it through
//!
//! * the data node (`Session`, minor 0) - open, read, poll, ioctl
//! * the FINESSE nodes (minor 1-4) - only there if the slot is equipped
//! * the bridge node (`Plx9054Device`) - ioctl only
//!
//! Every event is read as header, body and footer:
//!
//! ```text
//! 0x7FFF0008 | event number | subsys | crate | slot | 0 | 0
//! the record as the COPPER delivered it (magic ... trailer)
//! checksum (xor of header and record words) | 0x7FFF0009
//! ```

use std::fmt;
use std::sync::{
  Arc,
  Mutex,
  MutexGuard,
};
use std::sync::atomic::{
  AtomicBool,
  Ordering,
};
use std::thread::{
  self,
  JoinHandle,
};
use std::time::{
  Duration,
  Instant,
};

use crate::constants::*;
use crate::control;
use crate::dma_engine::DmaStart;
use crate::errors::{
  BridgeError,
  DeviceError,
};
use crate::framer::xor_words;
use crate::ioctl::{
  CopperCommand,
  IoctlArg,
  Plx9054Command,
};
use crate::memory::{
  DmaWindow,
  InterruptLine,
  RegisterBlock,
  RegisterBridge,
};
use crate::pipeline::{
  Pipeline,
  PipelineState,
};
use crate::registers::{
  COPPER_REGSIZE,
  FINESSE_STA,
  PLX9054_REGSIZE,
};
use crate::settings::DriverSettings;
use crate::threads::{
  deferred_worker,
  interrupt_listener,
};

/// Minor number of the data node
pub const COPPER_MINOR : usize = 0;
/// Data node plus one node per FINESSE slot
pub const N_MINORS     : usize = 1 + N_FINESSE;

type OpenTable = Arc<Mutex<[bool; N_MINORS]>>;

fn lock_table(table : &OpenTable) -> MutexGuard<'_, [bool; N_MINORS]> {
  match table.lock() {
    Ok(guard)     => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

pub struct Driver {
  pipeline : Arc<Pipeline>,
  opened   : OpenTable,
  stop     : Arc<AtomicBool>,
  threads  : Vec<JoinHandle<()>>,
}

impl Driver {
  /// Allocate everything and start listening to the
  /// interrupt line. All interrupts stay off until
  /// the data node gets opened.
  pub fn load(bridge   : Arc<dyn RegisterBridge>,
              line     : Arc<dyn InterruptLine>,
              settings : &DriverSettings) -> Result<Self, BridgeError> {
    let pipeline = Arc::new(Pipeline::new(bridge, settings)?);
    pipeline.disable_interrupts();
    let mut driver = Self {
      pipeline,
      opened  : Arc::new(Mutex::new([false; N_MINORS])),
      stop    : Arc::new(AtomicBool::new(false)),
      threads : Vec::<JoinHandle<()>>::new(),
    };
    let timeout = Duration::from_millis(settings.irq_timeout_ms);

    let listener_pipeline = driver.pipeline.clone();
    let listener_stop     = driver.stop.clone();
    let listener = thread::Builder::new()
      .name("cpr-interrupt".into())
      .spawn(move || {
        interrupt_listener(listener_pipeline, line, listener_stop, timeout);
      });
    match listener {
      Err(err) => {
        error!("Failed to spawn the interrupt listener thread! {err}");
        return Err(BridgeError::InterruptFail);
      }
      Ok(handle) => driver.threads.push(handle)
    }

    let worker_pipeline = driver.pipeline.clone();
    let worker_stop     = driver.stop.clone();
    let work            = driver.pipeline.work_receiver();
    let worker = thread::Builder::new()
      .name("cpr-workq".into())
      .spawn(move || {
        deferred_worker(worker_pipeline, work, worker_stop, timeout);
      });
    match worker {
      Err(err) => {
        // the listener is stopped when driver goes out of scope
        error!("Failed to spawn the deferred worker thread! {err}");
        return Err(BridgeError::InterruptFail);
      }
      Ok(handle) => driver.threads.push(handle)
    }
    info!("COPPER driver loaded, {} DMA buffers of {} bytes",
          settings.n_dma_buffers, settings.dma_buffer_size());
    Ok(driver)
  }

  pub fn pipeline(&self) -> &Arc<Pipeline> {
    &self.pipeline
  }

  /// Bus addresses and extent of the DMA buffers
  pub fn dma_windows(&self) -> Vec<DmaWindow> {
    self.pipeline.lock().pool.windows()
  }

  /// Open a node
  ///
  /// Opening the data node starts a new run. A node
  /// can be open only once at a time.
  pub fn open(&self, minor : usize) -> Result<Session, DeviceError> {
    if minor >= N_MINORS {
      return Err(DeviceError::NoSuchDevice);
    }
    let bridge = self.pipeline.bridge();
    if minor != COPPER_MINOR {
      let equipped = bridge.read_reg32(RegisterBlock::Copper, FINESSE_STA);
      if equipped & (1 << (minor - 1)) == 0 {
        debug!("FINESSE {} is not equipped (FINESSE_STA={:#x})", minor - 1, equipped);
        return Err(DeviceError::NoSuchDevice);
      }
    }
    {
      let mut opened = lock_table(&self.opened);
      if opened[minor] {
        return Err(DeviceError::Busy);
      }
      opened[minor] = true;
    }

    if minor == COPPER_MINOR {
      control::disable_copper_intr(bridge);
      control::disable_pci_intr(bridge);
      control::disable_local_intr(bridge);
      self.pipeline.abort_dma();
      self.pipeline.init_run();
      self.pipeline.config_event_fifo_depth();
      control::enable_pci_intr(bridge);
      control::enable_local_intr(bridge);
    }
    let epoch = self.pipeline.lock().run.epoch;
    debug!("Opened minor {}", minor);
    Ok(Session::new(minor, self.pipeline.clone(), self.opened.clone(), epoch))
  }

  /// The bridge node
  pub fn open_bridge(&self) -> Plx9054Device {
    Plx9054Device {
      pipeline : self.pipeline.clone(),
    }
  }

  /// Stop the threads, switch the interrupts off
  /// and make sure no transfer is left running
  pub fn unload(mut self) {
    self.cleanup();
  }

  fn cleanup(&mut self) {
    if self.threads.is_empty() {
      return;
    }
    self.stop.store(true, Ordering::Relaxed);
    self.pipeline.disable_interrupts();
    if self.pipeline.lock().engine.is_active() {
      self.pipeline.abort_dma();
    }
    for handle in self.threads.drain(..) {
      let name = String::from(handle.thread().name().unwrap_or("<unnamed>"));
      if let Err(err) = handle.join() {
        error!("Thread {} did not end cleanly! {:?}", name, err);
      }
    }
    info!("COPPER driver unloaded");
  }
}

impl Drop for Driver {
  fn drop(&mut self) {
    self.cleanup();
  }
}

/// Wakes up a reader blocked in `Session::read`,
/// which then returns `Interrupted`. This is what
/// a signal does to a blocking read.
#[derive(Clone)]
pub struct ReadInterrupt {
  flag     : Arc<AtomicBool>,
  pipeline : Arc<Pipeline>,
}

impl ReadInterrupt {
  pub fn interrupt(&self) {
    {
      // no wake up gets lost between the check and the wait
      let _state = self.pipeline.lock();
      self.flag.store(true, Ordering::SeqCst);
    }
    self.pipeline.wake_readers();
  }

  fn take(&self) -> bool {
    self.flag.swap(false, Ordering::SeqCst)
  }
}

/// Where the reader is within the current event
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ReadPhase {
  Start,
  Header,
  Body,
  Footer,
}

impl fmt::Display for ReadPhase {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let phase = match self {
      ReadPhase::Start  => "START",
      ReadPhase::Header => "HEADER",
      ReadPhase::Body   => "BODY",
      ReadPhase::Footer => "FOOTER",
    };
    write!(f, "<ReadPhase: {}>", phase)
  }
}

/// An open node
pub struct Session {
  minor      : usize,
  pipeline   : Arc<Pipeline>,
  opened     : OpenTable,
  interrupt  : ReadInterrupt,
  phase      : ReadPhase,
  header     : [u8; DRIVER_HEADER_SIZE],
  footer     : [u8; DRIVER_FOOTER_SIZE],
  /// bytes of header/footer already read
  cursor     : usize,
  /// run epoch the read state belongs to
  epoch      : u64,
  n_events   : u64,
  /// a blocked reader looks at the
  /// interrupt flag at least this often
  wait_slice : Duration,
}

impl Session {
  fn new(minor    : usize,
         pipeline : Arc<Pipeline>,
         opened   : OpenTable,
         epoch    : u64) -> Self {
    let interrupt = ReadInterrupt {
      flag     : Arc::new(AtomicBool::new(false)),
      pipeline : pipeline.clone(),
    };
    Self {
      minor,
      pipeline,
      opened,
      interrupt,
      phase      : ReadPhase::Start,
      header     : [0u8; DRIVER_HEADER_SIZE],
      footer     : [0u8; DRIVER_FOOTER_SIZE],
      cursor     : 0,
      epoch,
      n_events   : 0,
      wait_slice : Duration::from_millis(100),
    }
  }

  pub fn minor(&self) -> usize {
    self.minor
  }

  pub fn phase(&self) -> ReadPhase {
    self.phase
  }

  /// Events read completely in this session
  pub fn n_events(&self) -> u64 {
    self.n_events
  }

  pub fn read_interrupt(&self) -> ReadInterrupt {
    self.interrupt.clone()
  }

  /// Read the event stream
  ///
  /// Blocks until an event is there, unless the run
  /// has ended. Returns 0 (EOF) once the run has ended
  /// and everything was read. A call never reads beyond
  /// the footer of the current event.
  pub fn read(&mut self, buf : &mut [u8]) -> Result<usize, DeviceError> {
    if self.minor != COPPER_MINOR || buf.is_empty() {
      return Ok(0);
    }
    let pipeline  = self.pipeline.clone();
    let mut state = pipeline.lock();
    self.check_epoch(&state);
    if self.phase == ReadPhase::Start {
      loop {
        if !state.queue.is_empty() {
          break;
        }
        if self.interrupt.take() {
          debug!("Read interrupted");
          return Err(DeviceError::Interrupted);
        }
        if state.run.end_run {
          debug!("Run ended after {} events, EOF", state.run.event_number);
          return Ok(0);
        }
        state = pipeline.wait_readable(state, self.wait_slice);
        self.check_epoch(&state);
      }
    }

    let mut written      = 0usize;
    let mut transitioned = false;
    while written < buf.len() {
      match self.phase {
        ReadPhase::Start => {
          if !self.begin_event(&state) {
            break;
          }
        }
        ReadPhase::Header => {
          let n = copy_bytes(&self.header[self.cursor..], &mut buf[written..]);
          self.cursor += n;
          written     += n;
          if self.cursor == DRIVER_HEADER_SIZE {
            self.phase   = ReadPhase::Body;
            self.cursor  = 0;
            transitioned = true;
          }
        }
        ReadPhase::Body => {
          let id = match state.queue.peek_id() {
            Some(id) => id,
            None => {
              error!("Event disappeared from the queue while reading it!");
              self.phase = ReadPhase::Start;
              break;
            }
          };
          let desc = match state.queue.get(id) {
            Some(desc) => *desc,
            None => {
              error!("Queue slot {} is not queued!", id);
              self.phase = ReadPhase::Start;
              break;
            }
          };
          let n = desc.len.min(buf.len() - written);
          buf[written..written + n].copy_from_slice(state.pool.buffer(desc.buffer).memory.region(desc.offset, n));
          written += n;
          if n == desc.len {
            if let Err(err) = state.queue.dequeue(id) {
              error!("Unable to dequeue event! {}", err);
            }
            state.pool.mark_consumed(desc.buffer);
            state.pool.set_read_buffer(desc.buffer);
            self.phase   = ReadPhase::Footer;
            self.cursor  = 0;
            transitioned = true;
          } else if let Some(remaining) = state.queue.get_mut(id) {
            remaining.advance(n);
          }
        }
        ReadPhase::Footer => {
          let n = copy_bytes(&self.footer[self.cursor..], &mut buf[written..]);
          self.cursor += n;
          written     += n;
          if self.cursor == DRIVER_FOOTER_SIZE {
            state.run.event_number = state.run.event_number.wrapping_add(1);
            self.n_events += 1;
            self.phase     = ReadPhase::Start;
            self.cursor    = 0;
            transitioned   = true;
            break;
          }
        }
      }
    }

    if transitioned && state.engine.buffer_full {
      let bridge = pipeline.bridge();
      match state.try_start(bridge) {
        DmaStart::Started(size) => {
          debug!("DMA of {} bytes restarted by the reader", size);
        }
        DmaStart::BufferFull | DmaStart::Oversize => {
          trace!("we read event, but there is no space to DMA {:?} bytes", state.engine.next_dma_size());
        }
        DmaStart::AlreadyActive => (),
        DmaStart::NoEventAvailable | DmaStart::RunEnded => {
          // nothing left to move, listen to the COPPER again
          state.engine.buffer_full = false;
          control::enable_local_intr(bridge);
          control::enable_pci_intr(bridge);
        }
      }
    }
    Ok(written)
  }

  /// Wait until an event can be read. Returns false
  /// if there was none within timeout.
  pub fn poll(&self, timeout : Duration) -> bool {
    if self.minor != COPPER_MINOR {
      return false;
    }
    let deadline  = Instant::now() + timeout;
    let mut state = self.pipeline.lock();
    loop {
      if !state.queue.is_empty() {
        return true;
      }
      let now = Instant::now();
      if now >= deadline {
        return false;
      }
      state = self.pipeline.wait_readable(state, deadline - now);
    }
  }

  /// Register passthrough and run control
  pub fn ioctl(&mut self, cmd : u32, mut arg : IoctlArg) -> Result<(), DeviceError> {
    let command  = CopperCommand::decode(cmd)?;
    let pipeline = &self.pipeline;
    trace!("ioctl {:#010x} {}", cmd, command);
    match command {
      CopperCommand::ReadRegister(offset) => {
        check_offset(offset, COPPER_REGSIZE)?;
        let value = pipeline.bridge().read_reg32(RegisterBlock::Copper, offset);
        arg.write_u32(value)?;
      }
      CopperCommand::WriteRegister(offset) => {
        check_offset(offset, COPPER_REGSIZE)?;
        let value = arg.read_u32()?;
        pipeline.bridge().write_reg32(RegisterBlock::Copper, offset, value);
      }
      CopperCommand::ResetFinesse     => pipeline.reset_finesse(),
      CopperCommand::InitRun          => pipeline.init_run(),
      CopperCommand::ResetCopper      => pipeline.reset_copper(),
      CopperCommand::ForceDma         => {
        pipeline.force_dma();
      }
      CopperCommand::EndRun           => pipeline.end_run(),
      CopperCommand::SetSubsys        => pipeline.set_subsys(arg.value()?),
      CopperCommand::SetCrate         => pipeline.set_crate(arg.value()?),
      CopperCommand::SetSlot          => pipeline.set_slot(arg.value()?),
      CopperCommand::EnableInterrupt  => pipeline.enable_interrupts(),
      CopperCommand::DisableInterrupt => pipeline.disable_interrupts(),
    }
    Ok(())
  }

  /// A new run (or a cleared pipeline) makes
  /// a half read event meaningless
  fn check_epoch(&mut self, state : &PipelineState) {
    if state.run.epoch == self.epoch {
      return;
    }
    if self.phase != ReadPhase::Start {
      warn!("Pipeline was reset while in {}, dropping the rest of the event", self.phase);
    }
    self.phase  = ReadPhase::Start;
    self.cursor = 0;
    self.epoch  = state.run.epoch;
  }

  /// Build header and footer of the oldest event. The
  /// checksum is computed here, once per event.
  fn begin_event(&mut self, state : &PipelineState) -> bool {
    let desc = match state.queue.peek() {
      Some(desc) => *desc,
      None       => return false,
    };
    let words = [DRIVER_HEADER_MAGIC,
                 state.run.event_number,
                 state.identity.subsys,
                 state.identity.crate_,
                 state.identity.slot,
                 0,
                 0];
    for (k, w) in words.iter().enumerate() {
      self.header[k*SIZEOF_U32..(k+1)*SIZEOF_U32].copy_from_slice(&w.to_le_bytes());
    }
    let body     = state.pool.buffer(desc.buffer).memory.region(desc.offset, desc.len);
    let checksum = xor_words(&self.header) ^ xor_words(body);
    self.footer[0..SIZEOF_U32].copy_from_slice(&checksum.to_le_bytes());
    self.footer[SIZEOF_U32..DRIVER_FOOTER_SIZE].copy_from_slice(&DRIVER_FOOTER_MAGIC.to_le_bytes());
    trace!("event {} {} xor {:08x}", state.run.event_number, desc, checksum);
    self.phase  = ReadPhase::Header;
    self.cursor = 0;
    true
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    if self.minor == COPPER_MINOR {
      let bridge = self.pipeline.bridge();
      control::disable_copper_intr(bridge);
      control::disable_local_intr(bridge);
    }
    lock_table(&self.opened)[self.minor] = false;
    debug!("Closed minor {} after {} events", self.minor, self.n_events);
  }
}

/// The PLX9054 node
pub struct Plx9054Device {
  pipeline : Arc<Pipeline>,
}

impl Plx9054Device {
  pub fn ioctl(&self, cmd : u32, mut arg : IoctlArg) -> Result<(), DeviceError> {
    let bridge = self.pipeline.bridge();
    match Plx9054Command::decode(cmd)? {
      Plx9054Command::ReadRegister(offset) => {
        check_offset(offset, PLX9054_REGSIZE)?;
        arg.write_u32(bridge.read_reg32(RegisterBlock::Plx9054, offset))?;
      }
      Plx9054Command::WriteRegister(offset) => {
        check_offset(offset, PLX9054_REGSIZE)?;
        let value = arg.read_u32()?;
        bridge.write_reg32(RegisterBlock::Plx9054, offset, value);
      }
      Plx9054Command::ClearDma => {
        info!("Clearing DMA buffers and event queue");
        self.pipeline.clear_dma();
      }
    }
    Ok(())
  }
}

fn copy_bytes(src : &[u8], dst : &mut [u8]) -> usize {
  let n = src.len().min(dst.len());
  dst[..n].copy_from_slice(&src[..n]);
  n
}

/// Registers are 32bit and have to be inside the block
fn check_offset(offset : u32, regsize : usize) -> Result<(), DeviceError> {
  if offset as usize % SIZEOF_U32 != 0 || offset as usize + SIZEOF_U32 > regsize {
    return Err(DeviceError::InvalidArgument);
  }
  Ok(())
}

#[cfg(test)]
mod test_device {
  use super::*;
  use crate::framer::{
    build_record,
    words_to_bytes,
  };
  use crate::ioctl::*;
  use crate::registers::*;
  use crate::sim::SimulatedCopper;

  /// Interrupts never arrive, the tests move
  /// the events themselves
  struct QuietLine;

  impl InterruptLine for QuietLine {
    fn wait_asserted(&self, timeout : Duration) -> Result<bool, BridgeError> {
      thread::sleep(timeout);
      Ok(false)
    }

    fn unmask(&self) -> Result<(), BridgeError> {
      Ok(())
    }
  }

  fn driver() -> (Arc<SimulatedCopper>, Driver) {
    let sim = Arc::new(SimulatedCopper::new());
    let mut settings = DriverSettings::new();
    settings.dma_pages      = 0;
    settings.irq_timeout_ms = 5;
    let driver = Driver::load(sim.clone(), Arc::new(QuietLine), &settings).unwrap();
    sim.map_windows(driver.dma_windows());
    (sim, driver)
  }

  fn queue_record(sim : &SimulatedCopper, driver : &Driver, sizes : [u32; 4], payload : &[u32]) {
    sim.push_record(sizes, payload);
    assert!(matches!(driver.pipeline().force_dma(), DmaStart::Started(_)));
    assert_eq!(driver.pipeline().lock().complete_transfer(), Some(1));
  }

  #[test]
  fn second_open_is_busy() {
    let (_sim, driver) = driver();
    let session = driver.open(COPPER_MINOR).unwrap();
    assert_eq!(driver.open(COPPER_MINOR).err(), Some(DeviceError::Busy));
    drop(session);
    assert!(driver.open(COPPER_MINOR).is_ok());
  }

  #[test]
  fn missing_finesse_slot() {
    let (sim, driver) = driver();
    sim.write_reg32(RegisterBlock::Copper, FINESSE_STA, 0x5);
    assert!(driver.open(1).is_ok());
    assert_eq!(driver.open(2).err(), Some(DeviceError::NoSuchDevice));
    assert_eq!(driver.open(N_MINORS).err(), Some(DeviceError::NoSuchDevice));
    let mut finesse = driver.open(3).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(finesse.read(&mut buf), Ok(0));
  }

  #[test]
  fn read_one_event() {
    let (sim, driver) = driver();
    let mut session = driver.open(COPPER_MINOR).unwrap();
    driver.pipeline().set_module_identity(crate::run::ModuleIdentity::new(1, 2, 3));
    queue_record(&sim, &driver, [1, 0, 0, 0], &[0x42]);
    let mut buf = vec![0u8; 1000];
    let n = session.read(&mut buf).unwrap();
    assert_eq!(n, DRIVER_HEADER_SIZE + 8*4 + DRIVER_FOOTER_SIZE);
    let mut expected = words_to_bytes(&[DRIVER_HEADER_MAGIC, 0, 1, 2, 3, 0, 0]);
    let record       = words_to_bytes(&build_record([1, 0, 0, 0], &[0x42]));
    let checksum     = xor_words(&expected) ^ xor_words(&record);
    expected.extend_from_slice(&record);
    expected.extend_from_slice(&words_to_bytes(&[checksum, DRIVER_FOOTER_MAGIC]));
    assert_eq!(&buf[..n], &expected[..]);
    assert_eq!(session.n_events(), 1);
    assert_eq!(driver.pipeline().status().in_use, vec![0; 4]);
  }

  #[test]
  fn partial_reads_keep_their_place() {
    let (sim, driver) = driver();
    let mut session = driver.open(COPPER_MINOR).unwrap();
    queue_record(&sim, &driver, [2, 0, 0, 0], &[7, 8]);
    let mut buf = [0u8; 10];
    assert_eq!(session.read(&mut buf), Ok(10));
    assert_eq!(session.phase(), ReadPhase::Header);
    assert_eq!(session.read(&mut buf), Ok(10));
    assert_eq!(session.read(&mut buf), Ok(10));
    assert_eq!(session.phase(), ReadPhase::Body);
    // the queued descriptor shrank by what was read
    assert_eq!(driver.pipeline().lock().queue.peek().unwrap().len, 36 - 2);
  }

  #[test]
  fn interrupted_without_side_effects() {
    let (_sim, driver) = driver();
    let mut session = driver.open(COPPER_MINOR).unwrap();
    let interrupt   = session.read_interrupt();
    let waker = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      interrupt.interrupt();
    });
    let mut buf = [0u8; 64];
    assert_eq!(session.read(&mut buf), Err(DeviceError::Interrupted));
    waker.join().unwrap();
    assert_eq!(session.phase(), ReadPhase::Start);
  }

  #[test]
  fn ready_event_wins_over_interrupt() {
    let (sim, driver) = driver();
    let mut session = driver.open(COPPER_MINOR).unwrap();
    queue_record(&sim, &driver, [1, 0, 0, 0], &[1]);
    session.read_interrupt().interrupt();
    let mut buf = [0u8; 256];
    assert_eq!(session.read(&mut buf), Ok(DRIVER_HEADER_SIZE + 32 + DRIVER_FOOTER_SIZE));
    assert_eq!(session.phase(), ReadPhase::Start);
    // nothing left, now the interrupt counts
    assert_eq!(session.read(&mut buf), Err(DeviceError::Interrupted));
  }

  #[test]
  fn init_run_drops_partial_event() {
    let (sim, driver) = driver();
    let mut session = driver.open(COPPER_MINOR).unwrap();
    queue_record(&sim, &driver, [1, 0, 0, 0], &[1]);
    let mut buf = [0u8; 4];
    session.read(&mut buf).unwrap();
    assert_eq!(session.phase(), ReadPhase::Header);
    driver.pipeline().init_run();
    driver.pipeline().end_run();
    assert_eq!(session.read(&mut buf), Ok(0));
    assert_eq!(session.phase(), ReadPhase::Start);
  }

  #[test]
  fn poll_times_out() {
    let (sim, driver) = driver();
    let session = driver.open(COPPER_MINOR).unwrap();
    assert!(!session.poll(Duration::from_millis(10)));
    queue_record(&sim, &driver, [0, 0, 0, 0], &[]);
    assert!(session.poll(Duration::from_millis(10)));
  }

  #[test]
  fn register_passthrough() {
    let (sim, driver) = driver();
    let mut session = driver.open(COPPER_MINOR).unwrap();
    sim.push_record([3, 0, 0, 0], &[1, 2, 3]);
    let mut value = [0u8; 4];
    session.ioctl(copper_read_cmd(LEF_TOTAL), IoctlArg::Buffer(&mut value)).unwrap();
    assert_eq!(u32::from_le_bytes(value), 10);
    let mut mask = 5u32.to_le_bytes();
    session.ioctl(copper_write_cmd(INT_MASK), IoctlArg::Buffer(&mut mask)).unwrap();
    assert_eq!(sim.read_reg32(RegisterBlock::Copper, INT_MASK), 5);
    let mut short = [0u8; 2];
    assert_eq!(session.ioctl(copper_read_cmd(LEF_TOTAL), IoctlArg::Buffer(&mut short)),
               Err(DeviceError::Fault));
    assert_eq!(session.ioctl(io(COPPER_MAGIC, 200), IoctlArg::None),
               Err(DeviceError::InvalidArgument));
  }

  #[test]
  fn identity_through_ioctl() {
    let (_sim, driver) = driver();
    let mut session = driver.open(COPPER_MINOR).unwrap();
    session.ioctl(CPRIO_SET_SUBSYS, IoctlArg::Value(4)).unwrap();
    session.ioctl(CPRIO_SET_CRATE,  IoctlArg::Value(5)).unwrap();
    session.ioctl(CPRIO_SET_SLOT,   IoctlArg::Value(6)).unwrap();
    assert_eq!(driver.pipeline().module_identity(), crate::run::ModuleIdentity::new(4, 5, 6));
  }

  #[test]
  fn bridge_node_clears() {
    let (sim, driver) = driver();
    let _session = driver.open(COPPER_MINOR).unwrap();
    queue_record(&sim, &driver, [1, 0, 0, 0], &[1]);
    let plx = driver.open_bridge();
    let mut value = [0u8; 4];
    plx.ioctl(plx9054_read_cmd(INTCSR), IoctlArg::Buffer(&mut value)).unwrap();
    assert!(u32::from_le_bytes(value) & INTCSR_PCI_INT_ENABLE != 0);
    plx.ioctl(PLXIO_CLEAR_DMA, IoctlArg::None).unwrap();
    assert_eq!(driver.pipeline().status().queue_count, 0);
    assert_eq!(plx.ioctl(CPRIO_INIT_RUN, IoctlArg::None), Err(DeviceError::InvalidArgument));
  }
}
