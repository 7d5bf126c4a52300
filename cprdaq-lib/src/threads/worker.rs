//! The interrupt bottom half
//!
//! Runs in its own thread whenever the top half asked
//! for it. Only one execution at a time (irq lock), all
//! changes of the pipeline state under the data lock.

use std::sync::Arc;
use std::sync::atomic::{
  AtomicBool,
  Ordering,
};
use std::time::Duration;

use crossbeam_channel::{
  Receiver,
  RecvTimeoutError,
};

use crate::control;
use crate::dma_engine::DmaStart;
use crate::memory::RegisterBlock;
use crate::pipeline::Pipeline;
use crate::registers::INTCSR;
use crate::threads::interrupt::InterruptStatus;

/// One execution of the deferred work
pub fn bottom_half(pipeline : &Pipeline) {
  let _serialized = pipeline.irq_lock();
  let status = InterruptStatus::from_raw(pipeline.bridge().read_reg32(RegisterBlock::Plx9054, INTCSR));
  handle_status(pipeline, status);
}

/// Act on an INTCSR snapshot. The snapshot is taken
/// outside the data lock, so whatever it says about the
/// DMA is checked again once the lock is held.
fn handle_status(pipeline : &Pipeline, status : InterruptStatus) {
  let bridge = pipeline.bridge();
  let mut backpressure = false;
  {
    let mut state = pipeline.lock();
    state.counters.bottom_halves += 1;
    state.engine.check_lost_interrupt(bridge, status.raw);
  }

  if status.dma0_done() {
    {
      let mut state = pipeline.lock();
      state.engine.note_dma_interrupt();
      if state.engine.is_active() && !control::dma_done(bridge) {
        // a try_start framed the finished transfer and
        // started the next one in the meantime
        debug!("DMA0 done was seen, but the transfer in flight is still running");
      } else {
        state.counters.dma_done += 1;
        match state.complete_transfer() {
          None    => debug!("DMA0 done, but no transfer was in flight"),
          Some(n) => trace!("DMA0 done, {} events, {} queued", n, state.queue.count()),
        }
        control::clear_dma_error(bridge);
        control::enable_local_intr(bridge);
        control::enable_pci_intr(bridge);
      }
    }
    pipeline.wake_readers();
  }

  if status.local_active() {
    let mut wake = false;
    {
      let mut state = pipeline.lock();
      state.counters.local_ints += 1;
      control::disable_local_intr(bridge);
      if state.engine.is_active() {
        trace!("local input active, but DMA is active {}", status);
      } else if control::get_int_sta(bridge) != 0 {
        match state.try_start(bridge) {
          DmaStart::Started(size) => {
            // local interrupts come back with the DMA done
            trace!("Started DMA of {} bytes", size);
          }
          DmaStart::BufferFull | DmaStart::Oversize => {
            if state.engine.n_buffer_full == 1 {
              warn!("Failed to allocate enough space on DMA!");
            }
            backpressure = true;
            wake         = true;
          }
          DmaStart::AlreadyActive => (),
          DmaStart::NoEventAvailable | DmaStart::RunEnded => {
            trace!("Nothing started");
          }
        }
      } else {
        // spurious, nothing pending
        control::enable_local_intr(bridge);
      }
    }
    if wake {
      pipeline.wake_readers();
    }
  }

  // under backpressure the reader restarts the DMA
  if !backpressure {
    control::enable_pci_intr(bridge);
  }
}

/// Run the bottom half whenever it is scheduled
///
/// # Arguments
///
/// * pipeline : the driver context
/// * work     : the top half sends on this
/// * stop     : end the thread when set
/// * timeout  : look at stop at least this often
pub fn deferred_worker(pipeline : Arc<Pipeline>,
                       work     : Receiver<()>,
                       stop     : Arc<AtomicBool>,
                       timeout  : Duration) {
  info!("Deferred worker started");
  while !stop.load(Ordering::Relaxed) {
    match work.recv_timeout(timeout) {
      Ok(_) => bottom_half(&pipeline),
      Err(RecvTimeoutError::Timeout) => continue,
      Err(RecvTimeoutError::Disconnected) => {
        error!("Work channel disconnected, stopping!");
        break;
      }
    }
  }
  info!("Deferred worker stopped");
}

#[cfg(test)]
mod test_worker {
  use super::*;
  use crate::memory::RegisterBridge;
  use crate::settings::DriverSettings;
  use crate::sim::SimulatedCopper;
  use crate::threads::interrupt::top_half;

  fn pipeline(dma_pages : u32) -> (Arc<SimulatedCopper>, Pipeline) {
    let sim = Arc::new(SimulatedCopper::new());
    let mut settings = DriverSettings::new();
    settings.dma_pages     = dma_pages;
    settings.n_dma_buffers = 2;
    let pipeline = Pipeline::new(sim.clone(), &settings).unwrap();
    sim.map_windows(pipeline.lock().pool.windows());
    control::enable_interrupts(&*sim);
    (sim, pipeline)
  }

  /// top half + bottom half until the line is quiet
  fn service(sim : &SimulatedCopper, p : &Pipeline) -> usize {
    let mut n = 0;
    while sim.interrupt_asserted() && n < 100 {
      top_half(p);
      bottom_half(p);
      n += 1;
    }
    n
  }

  #[test]
  fn event_goes_all_the_way() {
    let (sim, p) = pipeline(0);
    sim.push_record([1, 1, 0, 0], &[0xAA, 0xBB]);
    // local -> start, dma done -> frame
    assert_eq!(service(&sim, &p), 2);
    let status = p.status();
    assert_eq!(status.queue_count, 1);
    assert_eq!(status.local_ints, 1);
    assert_eq!(status.dma_done, 1);
    assert_eq!(status.dma_count, 1);
    assert!(!status.dma_active);
  }

  #[test]
  fn several_events() {
    let (sim, p) = pipeline(0);
    for k in 0..5 {
      sim.push_record([k, 0, 0, 0], &vec![k; k as usize]);
    }
    service(&sim, &p);
    assert_eq!(p.status().queue_count, 5);
    let seen : Vec<usize> = p.lock().queue.iter().map(|d| d.len).collect();
    assert_eq!(seen, vec![28, 32, 36, 40, 44]);
  }

  #[test]
  fn backpressure_keeps_pci_off() {
    // two buffers of 4096 bytes, events of 2800 bytes
    let (sim, p) = pipeline(0);
    for _ in 0..3 {
      sim.push_record([693, 0, 0, 0], &vec![0; 693]);
    }
    service(&sim, &p);
    let status = p.status();
    assert_eq!(status.queue_count, 2);
    assert!(status.buffer_full);
    assert!(!sim.interrupt_asserted());
    assert_eq!(sim.pending_events(), 1);
  }

  #[test]
  fn stale_done_leaves_next_transfer_alone() {
    let (sim, p) = pipeline(0);
    sim.set_hold_dma(true);
    for k in 0..3 {
      sim.push_record([1, 0, 0, 0], &[k]);
    }
    assert_eq!(p.force_dma(), DmaStart::Started(32));
    assert!(sim.release_dma());
    // the bottom half looks at INTCSR ...
    let status = InterruptStatus::from_raw(sim.read_reg32(RegisterBlock::Plx9054, INTCSR));
    assert!(status.dma0_done());
    // ... but the watchdog gets the data lock first
    assert_eq!(p.force_dma(), DmaStart::Started(32));
    assert!(sim.dma_held());
    handle_status(&p, status);
    assert!(p.status().dma_active);
    assert_eq!(p.status().queue_count, 1);
    assert_eq!(p.force_dma(), DmaStart::AlreadyActive);

    while sim.release_dma() {
      service(&sim, &p);
    }
    assert_eq!(p.status().queue_count, 3);
    assert_eq!(p.status().lost_words, 0);
    assert_eq!(sim.n_transfers(), 3);
  }

  #[test]
  fn held_transfer_blocks_local() {
    let (sim, p) = pipeline(0);
    sim.set_hold_dma(true);
    sim.push_record([1, 0, 0, 0], &[1]);
    sim.push_record([1, 0, 0, 0], &[2]);
    service(&sim, &p);
    assert!(p.status().dma_active);
    assert_eq!(p.status().queue_count, 0);
    sim.release_dma();
    service(&sim, &p);
    sim.release_dma();
    service(&sim, &p);
    assert_eq!(p.status().queue_count, 2);
  }
}
