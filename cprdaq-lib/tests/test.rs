use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;

use cprdaq_lib::DriverSettings;
use cprdaq_lib::constants::*;
use cprdaq_lib::device::{
  Driver,
  ReadPhase,
  Session,
  COPPER_MINOR,
};
use cprdaq_lib::dma_buffer::DmaBufferPool;
use cprdaq_lib::dma_engine::DmaStart;
use cprdaq_lib::errors::{
  BridgeError,
  PoolError,
};
use cprdaq_lib::event_queue::EventQueue;
use cprdaq_lib::framer::{
  self,
  build_record,
  words_to_bytes,
  xor_words,
  EventDescriptor,
};
use cprdaq_lib::memory::{
  DmaSource,
  InterruptLine,
};
use cprdaq_lib::run::ModuleIdentity;
use cprdaq_lib::sim::SimulatedCopper;

/// Interrupts never arrive, the events are
/// moved by force_dma
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

fn small_settings() -> DriverSettings {
  let mut settings = DriverSettings::new();
  settings.dma_pages      = 0;
  settings.irq_timeout_ms = 5;
  settings
}

fn quiet_driver() -> (Arc<SimulatedCopper>, Driver) {
  let sim    = Arc::new(SimulatedCopper::new());
  let driver = Driver::load(sim.clone(), Arc::new(QuietLine), &small_settings()).unwrap();
  sim.map_windows(driver.dma_windows());
  (sim, driver)
}

/// Record -> event FIFO -> DMA buffer -> event queue
fn queue_record(sim : &SimulatedCopper, driver : &Driver, sizes : [u32; 4], payload : &[u32]) {
  sim.push_record(sizes, payload);
  assert!(matches!(driver.pipeline().force_dma(), DmaStart::Started(_)));
  assert_eq!(driver.pipeline().lock().complete_transfer(), Some(1));
}

/// Read one event in chunks of random size
fn read_chunked(session : &mut Session, max_chunk : usize) -> Vec<u8> {
  let mut rng = rand::thread_rng();
  let mut out = Vec::<u8>::new();
  loop {
    let mut buf = vec![0u8; rng.gen_range(1..=max_chunk)];
    let n = session.read(&mut buf).unwrap();
    out.extend_from_slice(&buf[..n]);
    if n == 0 || session.phase() == ReadPhase::Start {
      break;
    }
  }
  out
}

fn expected_event(event_number : u32,
                  identity     : ModuleIdentity,
                  record       : &[u32]) -> Vec<u8> {
  let header = words_to_bytes(&[DRIVER_HEADER_MAGIC, event_number,
                                identity.subsys, identity.crate_, identity.slot, 0, 0]);
  let body   = words_to_bytes(record);
  let footer = words_to_bytes(&[xor_words(&header) ^ xor_words(&body), DRIVER_FOOTER_MAGIC]);
  let mut event = header;
  event.extend_from_slice(&body);
  event.extend_from_slice(&footer);
  event
}

#[test]
fn framing_finds_all_records() {
  for k in 0..6u32 {
    let mut words = Vec::<u32>::new();
    let mut starts = Vec::<(usize, usize)>::new();
    for j in 0..k {
      let record = build_record([j, 1, 0, 2], &vec![j; j as usize + 3]);
      starts.push((words.len()*4, record.len()*4));
      words.extend_from_slice(&record);
    }
    let region = words_to_bytes(&words);
    let framed = framer::scan(&region, 2, 64);
    assert_eq!(framed.events.len(), k as usize);
    assert_eq!(framed.lost_words, 0);
    for (desc, (start, len)) in framed.events.iter().zip(starts.iter()) {
      assert_eq!(*desc, EventDescriptor::new(2, 64 + start, *len));
    }
  }
}

#[test]
fn framing_stops_at_garbage() {
  let mut words = build_record([1, 0, 0, 0], &[5]);
  words.extend_from_slice(&build_record([0, 2, 0, 0], &[6, 7]));
  words.extend_from_slice(&[RECORD_MAGIC, 100, 1, 1, 1, 1, 0xdead]);
  let framed = framer::scan(&words_to_bytes(&words), 0, 0);
  assert_eq!(framed.events.len(), 2);
  assert_eq!(framed.lost_words, 7);
}

#[test]
fn queue_keeps_order_while_growing() {
  let mut queue = EventQueue::new(DEFAULT_QUEUE_ALLOTMENT);
  let n = DEFAULT_QUEUE_ALLOTMENT + 10;
  for k in 0..n {
    assert!(queue.enqueue(EventDescriptor::new(k % 4, k*8, 8)).is_ok());
  }
  assert_eq!(queue.count(), n);
  assert_eq!(queue.count() + queue.empty_count(), queue.capacity());
  for k in 0..n {
    let id = queue.peek_id().unwrap();
    assert_eq!(queue.dequeue(id).unwrap().offset, k*8);
  }
  assert!(queue.is_empty());
}

#[test]
fn pool_backpressure() {
  let mut pool = DmaBufferPool::allocate(&DmaSource::Anonymous, 3, 1024).unwrap();
  for k in 0..3 {
    let id = pool.find_write_target(1000).unwrap();
    assert_eq!(id, k);
    pool.record_transfer(id, 1000);
    pool.add_events(id, 2);
  }
  assert_eq!(pool.find_write_target(1000), Err(PoolError::BufferFull));
  assert_eq!(pool.find_write_target(4096), Err(PoolError::OversizeTransfer));
  pool.mark_consumed(0);
  assert_eq!(pool.find_write_target(1000), Err(PoolError::BufferFull));
  pool.mark_consumed(0);
  assert_eq!(pool.find_write_target(1000), Ok(0));
}

#[test]
fn end_to_end_72_bytes() {
  let record = build_record([1, 1, 0, 0], &[0xAA, 0xBB]);
  assert_eq!(record.len(), 9);
  let mut region = words_to_bytes(&record);
  region.resize(256, 0);
  let framed = framer::scan(&region, 0, 0);
  assert_eq!(framed.events, vec![EventDescriptor::new(0, 0, 36)]);

  let (sim, driver) = quiet_driver();
  let mut session = driver.open(COPPER_MINOR).unwrap();
  queue_record(&sim, &driver, [1, 1, 0, 0], &[0xAA, 0xBB]);
  let mut buf = vec![0u8; 1000];
  let n = session.read(&mut buf).unwrap();
  assert_eq!(n, 72);
  assert_eq!(&buf[..n], &expected_event(0, ModuleIdentity::default(), &record)[..]);
}

#[test]
fn chunking_does_not_matter() {
  let records : Vec<Vec<u32>> = (0..8u32)
    .map(|k| build_record([k, 2, 0, 1], &(0..k + 3).map(|w| w*0x01010101 + k).collect::<Vec<u32>>()))
    .collect();
  let identity = ModuleIdentity::new(3, 7, 11);

  for max_chunk in [1usize, 3, 7, 64, 1000] {
    let (sim, driver) = quiet_driver();
    let mut session = driver.open(COPPER_MINOR).unwrap();
    driver.pipeline().set_module_identity(identity);
    for record in records.iter() {
      sim.push_event(record);
      assert!(matches!(driver.pipeline().force_dma(), DmaStart::Started(_)));
      driver.pipeline().lock().complete_transfer();
    }
    for (k, record) in records.iter().enumerate() {
      let event = read_chunked(&mut session, max_chunk);
      assert_eq!(event, expected_event(k as u32, identity, record), "chunks up to {}", max_chunk);
      // checksum in the footer
      let footer   = &event[event.len() - DRIVER_FOOTER_SIZE..];
      let checksum = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
      assert_eq!(checksum, xor_words(&event[..event.len() - DRIVER_FOOTER_SIZE]));
    }
    assert_eq!(session.n_events(), records.len() as u64);
  }
}

#[test]
fn end_run_drains_then_eof() {
  let (sim, driver) = quiet_driver();
  let mut session = driver.open(COPPER_MINOR).unwrap();
  let mut records = Vec::<Vec<u32>>::new();
  for k in 0..3 {
    records.push(build_record([1, 0, 0, 0], &[k]));
    queue_record(&sim, &driver, [1, 0, 0, 0], &[k]);
  }
  driver.pipeline().end_run();
  // no new transfers once the run ended
  sim.push_record([1, 0, 0, 0], &[99]);
  assert_eq!(driver.pipeline().force_dma(), DmaStart::RunEnded);

  let mut buf = vec![0u8; 4096];
  for (k, record) in records.iter().enumerate() {
    let n = session.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], &expected_event(k as u32, ModuleIdentity::default(), record)[..]);
  }
  assert_eq!(session.read(&mut buf), Ok(0));
  assert_eq!(session.read(&mut buf), Ok(0));
}

#[test]
fn blocked_reader_sees_end_run() {
  let (_sim, driver) = quiet_driver();
  let mut session = driver.open(COPPER_MINOR).unwrap();
  let pipeline = driver.pipeline().clone();
  let ender = thread::spawn(move || {
    thread::sleep(Duration::from_millis(30));
    pipeline.end_run();
  });
  let mut buf = vec![0u8; 64];
  assert_eq!(session.read(&mut buf), Ok(0));
  ender.join().unwrap();
}

/// The whole thing with interrupts: the software COPPER
/// raises its line, the listener and the worker move the
/// events, the reader gets them in order.
#[test]
fn threaded_pipeline() {
  let sim = Arc::new(SimulatedCopper::new());
  let mut settings = small_settings();
  settings.n_dma_buffers = 2;
  let driver = Driver::load(sim.clone(), sim.clone(), &settings).unwrap();
  sim.map_windows(driver.dma_windows());
  let mut session = driver.open(COPPER_MINOR).unwrap();

  // each event takes most of a buffer, so the
  // reader has to get the DMA going again
  let n_events = 6u32;
  let mut records = Vec::<Vec<u32>>::new();
  for k in 0..n_events {
    let payload : Vec<u32> = (0..693).map(|w| w ^ k).collect();
    records.push(sim.push_record([693, 0, 0, 0], &payload));
  }

  // don't hang forever if something is broken
  let pipeline = driver.pipeline().clone();
  let _guard = thread::spawn(move || {
    thread::sleep(Duration::from_secs(10));
    pipeline.end_run();
  });

  // two events fill both buffers, the third has to wait
  let mut stalled = false;
  for _ in 0..1000 {
    if driver.pipeline().status().buffer_full {
      stalled = true;
      break;
    }
    thread::sleep(Duration::from_millis(5));
  }
  assert!(stalled);
  assert_eq!(driver.pipeline().status().queue_count, 2);

  let mut buf = vec![0u8; 8192];
  for (k, record) in records.iter().enumerate() {
    let n = session.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], &expected_event(k as u32, ModuleIdentity::default(), record)[..]);
  }
  let status = driver.pipeline().status();
  assert_eq!(status.dma_count, n_events as u64);
  assert!(status.interrupts > 0);
  assert_eq!(sim.pending_events(), 0);
  drop(session);
  driver.unload();
}

#[test]
fn settings_file_roundtrip() {
  let mut settings = DriverSettings::new();
  settings.n_dma_buffers = 8;
  settings.module        = ModuleIdentity::new(1, 0, 4);
  let fname = std::env::temp_dir().join("cprdaq-settings-test.toml");
  let fname = String::from(fname.to_string_lossy());
  settings.to_toml(fname.clone()).unwrap();
  let back = DriverSettings::from_toml(&fname).unwrap();
  assert_eq!(back, settings);
  println!("{}", back);
}
