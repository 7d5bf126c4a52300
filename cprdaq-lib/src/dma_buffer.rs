//! The ring of DMA buffers
//!
//! Transfers are placed one after the other into
//! the current write buffer. When it is full, we
//! move on to the next buffer in the ring, but only
//! if everything which was framed in there has been
//! read already. Otherwise the ring is full and the
//! caller has to wait for the reader (backpressure).

use std::fmt;

use crate::errors::{
  BridgeError,
  PoolError,
};
use crate::memory::{
  DmaMemory,
  DmaSource,
  DmaWindow,
  ANON_BUS_BASE,
};

/// Index of a buffer in the ring
pub type BufferId = usize;

pub struct DmaBuffer {
  pub memory : DmaMemory,
  /// Bytes reserved for transfers so far
  pub wpos   : usize,
  /// Number of events in this buffer
  /// which have not been read
  pub in_use : usize,
}

impl DmaBuffer {
  pub fn new(memory : DmaMemory) -> Self {
    Self {
      memory,
      wpos   : 0,
      in_use : 0,
    }
  }
}

pub struct DmaBufferPool {
  buffers  : Vec<DmaBuffer>,
  capacity : usize,
  /// buffer new transfers go to
  wbuf     : BufferId,
  /// buffer the reader currently drains
  rbuf     : BufferId,
}

impl DmaBufferPool {

  /// Get n_buffers of capacity bytes each from source
  pub fn allocate(source    : &DmaSource,
                  n_buffers : usize,
                  capacity  : usize) -> Result<Self, BridgeError> {
    let mut buffers = Vec::<DmaBuffer>::with_capacity(n_buffers);
    for k in 0..n_buffers {
      let memory = match source {
        DmaSource::Anonymous => {
          let bus_addr = ANON_BUS_BASE + (k*capacity) as u64;
          DmaMemory::anonymous(capacity, bus_addr)?
        }
        DmaSource::Uio(addr_space) => {
          DmaMemory::from_uio(addr_space, k, capacity)?
        }
      };
      buffers.push(DmaBuffer::new(memory));
    }
    info!("Allocated {} DMA buffers of {} bytes", n_buffers, capacity);
    Ok(Self::from_buffers(buffers, capacity))
  }

  pub fn from_buffers(buffers : Vec<DmaBuffer>, capacity : usize) -> Self {
    Self {
      buffers,
      capacity,
      wbuf : 0,
      rbuf : 0,
    }
  }

  /// Size of one buffer in bytes
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn len(&self) -> usize {
    self.buffers.len()
  }

  pub fn write_buffer(&self) -> BufferId {
    self.wbuf
  }

  pub fn read_buffer(&self) -> BufferId {
    self.rbuf
  }

  pub fn set_read_buffer(&mut self, id : BufferId) {
    self.rbuf = id;
  }

  pub fn buffer(&self, id : BufferId) -> &DmaBuffer {
    &self.buffers[id]
  }

  pub fn buffer_mut(&mut self, id : BufferId) -> &mut DmaBuffer {
    &mut self.buffers[id]
  }

  /// What a bus master needs to know
  /// about all the buffers
  pub fn windows(&self) -> Vec<DmaWindow> {
    self.buffers.iter().map(|b| b.memory.window()).collect()
  }

  /// Find the buffer the next transfer of size bytes goes to
  ///
  /// This might advance the ring. The space is not yet
  /// reserved, see `record_transfer`.
  pub fn find_write_target(&mut self, size : usize) -> Result<BufferId, PoolError> {
    if size > self.capacity {
      debug!("size {} > bufsize {} (too large)", size, self.capacity);
      return Err(PoolError::OversizeTransfer);
    }
    if self.capacity - self.buffers[self.wbuf].wpos > size {
      return Ok(self.wbuf);
    }
    let next = (self.wbuf + 1) % self.buffers.len();
    debug!("bufno {}->{} (size={})", self.wbuf, next, size);
    if self.buffers[next].in_use == 0 {
      self.wbuf = next;
      self.buffers[next].wpos = 0;
      return Ok(next);
    }
    // so, next buffer contains data. it means all buffer are occupied
    debug!("but buffer {} still holds {} events", next, self.buffers[next].in_use);
    Err(PoolError::BufferFull)
  }

  /// Reserve size bytes in buffer id, returns the
  /// offset the transfer starts at
  pub fn record_transfer(&mut self, id : BufferId, size : usize) -> usize {
    let buffer = &mut self.buffers[id];
    let offset = buffer.wpos;
    debug_assert!(offset + size <= self.capacity);
    buffer.wpos += size;
    offset
  }

  /// Account for events framed in buffer id
  pub fn add_events(&mut self, id : BufferId, n_events : usize) {
    self.buffers[id].in_use += n_events;
  }

  /// One event of buffer id has been read
  pub fn mark_consumed(&mut self, id : BufferId) {
    let buffer = &mut self.buffers[id];
    if buffer.in_use == 0 {
      error!("Buffer {} has no events left, but one was consumed!", id);
      return;
    }
    buffer.in_use -= 1;
  }

  /// Forget about everything in the buffers
  pub fn clear(&mut self) {
    for b in self.buffers.iter_mut() {
      b.wpos   = 0;
      b.in_use = 0;
    }
    self.wbuf = 0;
    self.rbuf = 0;
  }

  pub fn write_positions(&self) -> Vec<usize> {
    self.buffers.iter().map(|b| b.wpos).collect()
  }

  pub fn in_use(&self) -> Vec<usize> {
    self.buffers.iter().map(|b| b.in_use).collect()
  }
}

impl fmt::Display for DmaBufferPool {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<DmaBufferPool:");
    repr += &(format!("\n  capacity : {}", self.capacity));
    repr += &(format!("\n  wbuf     : {}", self.wbuf));
    repr += &(format!("\n  rbuf     : {}", self.rbuf));
    repr += &(format!("\n  wpos     : {:?}", self.write_positions()));
    repr += &(format!("\n  in_use   : {:?}>", self.in_use()));
    write!(f, "{}", repr)
  }
}

#[cfg(test)]
mod test_dma_buffer {
  use super::*;

  fn pool(n : usize, capacity : usize) -> DmaBufferPool {
    DmaBufferPool::allocate(&DmaSource::Anonymous, n, capacity).unwrap()
  }

  #[test]
  fn oversize_transfer() {
    let mut p = pool(4, 1024);
    assert_eq!(p.find_write_target(1025), Err(PoolError::OversizeTransfer));
    assert_eq!(p.find_write_target(1000), Ok(0));
  }

  #[test]
  fn stays_in_buffer_while_room() {
    let mut p = pool(4, 1024);
    let id = p.find_write_target(100).unwrap();
    assert_eq!(p.record_transfer(id, 100), 0);
    let id = p.find_write_target(100).unwrap();
    assert_eq!(id, 0);
    assert_eq!(p.record_transfer(id, 100), 100);
  }

  #[test]
  fn advances_and_resets_wpos() {
    let mut p = pool(4, 1024);
    let id = p.find_write_target(1000).unwrap();
    p.record_transfer(id, 1000);
    p.add_events(id, 1);
    let id = p.find_write_target(100).unwrap();
    assert_eq!(id, 1);
    assert_eq!(p.buffer(1).wpos, 0);
    assert_eq!(p.write_buffer(), 1);
  }

  #[test]
  fn backpressure_until_consumed() {
    let mut p = pool(4, 1024);
    for k in 0..4 {
      let id = p.find_write_target(1000).unwrap();
      assert_eq!(id, k);
      p.record_transfer(id, 1000);
      p.add_events(id, 1);
    }
    assert_eq!(p.find_write_target(1000), Err(PoolError::BufferFull));
    assert_eq!(p.find_write_target(24), Err(PoolError::BufferFull));
    // the remainder of the current buffer is still usable
    assert_eq!(p.find_write_target(10), Ok(3));
    // does not move the write cursor
    assert_eq!(p.write_buffer(), 3);
    p.mark_consumed(0);
    assert_eq!(p.find_write_target(1000), Ok(0));
  }

  #[test]
  fn exact_fit_moves_on() {
    // capacity - wpos must be strictly larger
    let mut p = pool(2, 1024);
    let id = p.find_write_target(512).unwrap();
    p.record_transfer(id, 512);
    assert_eq!(p.find_write_target(512), Ok(1));
  }

  #[test]
  fn clear_resets_everything() {
    let mut p = pool(2, 1024);
    let id = p.find_write_target(1000).unwrap();
    p.record_transfer(id, 1000);
    p.add_events(id, 3);
    p.clear();
    assert_eq!(p.write_positions(), vec![0,0]);
    assert_eq!(p.in_use(), vec![0,0]);
    assert_eq!(p.write_buffer(), 0);
  }
}
