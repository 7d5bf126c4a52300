//! Access to the hardware: registers, interrupt
//! line and the memory the DMA engine writes into
//!
//! On the readout computer the PLX9054 is exposed
//! through the UIO framework:
//!
//! /dev/uio0 - map0 : PLX9054 local configuration (BAR0)
//!           - map1 : COPPER local bus registers  (BAR2)
//! /dev/uio1 - optional, physically contiguous memory for
//!             the DMA buffers (one map per buffer)
//!
//! Reading 4 bytes from /dev/uio0 blocks until the
//! interrupt fires, writing 1 unmasks it again.

extern crate memmap;

use std::fs::{
  self,
  File,
};
use std::io::{
  ErrorKind,
  Read,
  Write,
};
use std::os::unix::fs::OpenOptionsExt;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{
  fence,
  Ordering,
};
use std::thread;
use std::time::{
  Duration,
  Instant,
};

use memmap::MmapMut;

use crate::constants::PAGE_SIZE;
use crate::errors::BridgeError;
use crate::registers::{
  COPPER_REGSIZE,
  PLX9054_REGSIZE,
};

cfg_if::cfg_if! {
  if #[cfg(target_os = "linux")] {
    const O_NONBLOCK : i32 = 0o4000;
  } else {
    const O_NONBLOCK : i32 = 0x0004;
  }
}

pub const UIO0 : &'static str = "/dev/uio0";
pub const UIO1 : &'static str = "/dev/uio1";

/// The two register windows
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum RegisterBlock {
  /// Bridge control/status (DMA, interrupts)
  Plx9054,
  /// COPPER FIFO, length FIFO status/config
  Copper,
}

/// Read and write 32bit registers in one of the
/// two register blocks.
///
/// Implementations have to be cheap and must not
/// block, the interrupt top half uses them.
pub trait RegisterBridge : Send + Sync {
  fn read_reg32(&self, block : RegisterBlock, offset : u32) -> u32;
  fn write_reg32(&self, block : RegisterBlock, offset : u32, value : u32);
}

/// The interrupt line of the device
pub trait InterruptLine : Send + Sync {
  /// Wait until the line is asserted. Returns false
  /// if nothing happened within timeout.
  ///
  /// Once this returned true, the line stays masked
  /// until `unmask` is called.
  fn wait_asserted(&self, timeout : Duration) -> Result<bool, BridgeError>;
  fn unmask(&self) -> Result<(), BridgeError>;
}

/// Map a region of a UIO device for reading and writing
///
/// UIO exposes map N at offset N * page size.
pub fn map_uio_region(addr_space : &str,
                      map_index  : usize,
                      len        : usize)
  -> Result<MmapMut, BridgeError> {
  let file = match File::options()
    .read(true)
    .write(true)
    .open(addr_space) {
    Err(err) => {
      error!("Unable to open {}! {}", addr_space, err);
      return Err(BridgeError::DeviceNotFound);
    }
    Ok(f) => f
  };
  let m = unsafe {
    memmap::MmapOptions::new()
      .offset((map_index*PAGE_SIZE) as u64)
      .len(len)
      .map_mut(&file)
  };
  match m {
    Err(err) => {
      error!("Failed to mmap map{} of {}! {}", map_index, addr_space, err);
      Err(BridgeError::MMapFail)
    }
    Ok(m) => Ok(m)
  }
}

/// Get the physical address of a UIO map from sysfs
///
/// # Arguments
///
/// * addr_space : e.g. /dev/uio1
/// * map_index  : the N in mapN
pub fn uio_map_addr(addr_space : &str, map_index : usize) -> Result<u64, BridgeError> {
  let name  = addr_space.trim_start_matches("/dev/");
  let sysfs = format!("/sys/class/uio/{}/maps/map{}/addr", name, map_index);
  let content = match fs::read_to_string(&sysfs) {
    Err(err) => {
      error!("Can not read {}! {}", sysfs, err);
      return Err(BridgeError::AddressNotFound);
    }
    Ok(c) => c
  };
  match u64::from_str_radix(content.trim_end().trim_start_matches("0x"), 16) {
    Err(err) => {
      error!("Can not understand address {} in {}! {}", content, sysfs, err);
      Err(BridgeError::AddressNotFound)
    }
    Ok(addr) => Ok(addr)
  }
}

/// One mapped register window
struct RegisterWindow {
  _map : MmapMut,
  base : *mut u32,
  size : usize,
}

impl RegisterWindow {
  fn new(addr_space : &str, map_index : usize, size : usize) -> Result<Self, BridgeError> {
    let mut map = map_uio_region(addr_space, map_index, size)?;
    let base    = map.as_mut_ptr() as *mut u32;
    Ok(Self {
      _map : map,
      base,
      size,
    })
  }

  fn read(&self, offset : u32) -> u32 {
    if offset as usize + 4 > self.size {
      error!("Register offset {:#x} outside of window!", offset);
      return 0;
    }
    unsafe {
      ptr::read_volatile(self.base.add(offset as usize / 4))
    }
  }

  fn write(&self, offset : u32, value : u32) {
    if offset as usize + 4 > self.size {
      error!("Register offset {:#x} outside of window!", offset);
      return;
    }
    unsafe {
      ptr::write_volatile(self.base.add(offset as usize / 4), value);
    }
  }
}

/// PLX9054 + COPPER through /dev/uioX
pub struct UioBridge {
  plx9054    : RegisterWindow,
  copper     : RegisterWindow,
  irq_file   : Mutex<File>,
  /// sleep between two looks at the interrupt counter
  poll_every : Duration,
}

// The register windows are only ever touched
// with volatile 32bit accesses
unsafe impl Send for UioBridge {}
unsafe impl Sync for UioBridge {}

impl UioBridge {
  pub fn new(addr_space : &str) -> Result<Self, BridgeError> {
    let plx9054  = RegisterWindow::new(addr_space, 0, PLX9054_REGSIZE)?;
    let copper   = RegisterWindow::new(addr_space, 1, COPPER_REGSIZE)?;
    let irq_file = match File::options()
      .read(true)
      .write(true)
      .custom_flags(O_NONBLOCK)
      .open(addr_space) {
      Err(err) => {
        error!("Unable to open {} for interrupts! {}", addr_space, err);
        return Err(BridgeError::InterruptFail);
      }
      Ok(f) => f
    };
    info!("Mapped PLX9054 and COPPER registers from {}", addr_space);
    Ok(Self {
      plx9054,
      copper,
      irq_file   : Mutex::new(irq_file),
      poll_every : Duration::from_micros(50),
    })
  }
}

impl RegisterBridge for UioBridge {
  fn read_reg32(&self, block : RegisterBlock, offset : u32) -> u32 {
    match block {
      RegisterBlock::Plx9054 => self.plx9054.read(offset),
      RegisterBlock::Copper  => self.copper.read(offset),
    }
  }

  fn write_reg32(&self, block : RegisterBlock, offset : u32, value : u32) {
    match block {
      RegisterBlock::Plx9054 => self.plx9054.write(offset, value),
      RegisterBlock::Copper  => self.copper.write(offset, value),
    }
  }
}

impl InterruptLine for UioBridge {
  fn wait_asserted(&self, timeout : Duration) -> Result<bool, BridgeError> {
    let start     = Instant::now();
    let mut count = [0u8;4];
    loop {
      let result = match self.irq_file.lock() {
        Err(err) => {
          error!("Interrupt file lock poisoned! {err}");
          return Err(BridgeError::InterruptFail);
        }
        Ok(mut file) => file.read(&mut count)
      };
      match result {
        Ok(4) => {
          trace!("Interrupt count {}", u32::from_le_bytes(count));
          return Ok(true);
        }
        Ok(_) => {
          error!("Short read on interrupt counter!");
          return Err(BridgeError::InterruptFail);
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
          if start.elapsed() > timeout {
            return Ok(false);
          }
          thread::sleep(self.poll_every);
        }
        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
        Err(err) => {
          error!("Reading the interrupt counter failed! {err}");
          return Err(BridgeError::InterruptFail);
        }
      }
    }
  }

  fn unmask(&self) -> Result<(), BridgeError> {
    match self.irq_file.lock() {
      Err(err) => {
        error!("Interrupt file lock poisoned! {err}");
        Err(BridgeError::InterruptFail)
      }
      Ok(mut file) => {
        match file.write_all(&1u32.to_le_bytes()) {
          Err(err) => {
            error!("Can not unmask the interrupt! {err}");
            Err(BridgeError::InterruptFail)
          }
          Ok(_) => Ok(())
        }
      }
    }
  }
}

/// Where the DMA buffers live
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum DmaSource {
  /// Host memory. Only useful with a bus master
  /// which can translate the (synthetic) bus
  /// addresses, e.g. the software COPPER.
  Anonymous,
  /// Physically contiguous memory exposed by a
  /// UIO device, one map per buffer
  Uio(String),
}

/// Synthetic bus address of the first anonymous buffer
pub const ANON_BUS_BASE : u64 = 0x4000_0000;

/// Where a bus master may write to.
///
/// This is what a DMA capable device sees of
/// one buffer, its bus address and extent.
#[derive(Debug, Copy, Clone)]
pub struct DmaWindow {
  pub bus_addr : u64,
  pub len      : usize,
  ptr          : *mut u8,
}

unsafe impl Send for DmaWindow {}
unsafe impl Sync for DmaWindow {}

impl DmaWindow {
  /// Is [bus_addr, bus_addr + len) fully inside this window
  pub fn contains(&self, bus_addr : u64, len : usize) -> bool {
    bus_addr >= self.bus_addr
      && bus_addr + len as u64 <= self.bus_addr + self.len as u64
  }

  /// Deposit words at a bus address, as the DMA engine would
  ///
  /// Returns false if the destination is not (entirely)
  /// inside this window.
  pub fn write_words(&self, bus_addr : u64, words : &[u32]) -> bool {
    let nbytes = words.len()*4;
    if !self.contains(bus_addr, nbytes) {
      return false;
    }
    let offset = (bus_addr - self.bus_addr) as usize;
    for (k, w) in words.iter().enumerate() {
      unsafe {
        ptr::write_volatile(self.ptr.add(offset + 4*k) as *mut [u8;4], w.to_le_bytes());
      }
    }
    fence(Ordering::Release);
    true
  }
}

/// The memory behind one DMA buffer
pub struct DmaMemory {
  _map     : MmapMut,
  ptr      : *mut u8,
  len      : usize,
  bus_addr : u64,
}

// The memory is only accessed through raw pointers,
// disjoint regions by the bus master and the reader
unsafe impl Send for DmaMemory {}
unsafe impl Sync for DmaMemory {}

impl DmaMemory {
  /// Allocate host memory for a buffer
  pub fn anonymous(len : usize, bus_addr : u64) -> Result<Self, BridgeError> {
    let mut map = match MmapMut::map_anon(len) {
      Err(err) => {
        error!("Can not allocate {} bytes for DMA! {}", len, err);
        return Err(BridgeError::MMapFail);
      }
      Ok(m) => m
    };
    let ptr = map.as_mut_ptr();
    Ok(Self {
      _map : map,
      ptr,
      len,
      bus_addr,
    })
  }

  /// Map one of the contiguous regions of a UIO device
  pub fn from_uio(addr_space : &str,
                  map_index  : usize,
                  len        : usize) -> Result<Self, BridgeError> {
    let bus_addr = uio_map_addr(addr_space, map_index)?;
    let mut map  = map_uio_region(addr_space, map_index, len)?;
    let ptr      = map.as_mut_ptr();
    debug!("DMA buffer map{} of {} at bus address {:#x}", map_index, addr_space, bus_addr);
    Ok(Self {
      _map : map,
      ptr,
      len,
      bus_addr,
    })
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn bus_addr(&self) -> u64 {
    self.bus_addr
  }

  pub fn window(&self) -> DmaWindow {
    DmaWindow {
      bus_addr : self.bus_addr,
      len      : self.len,
      ptr      : self.ptr,
    }
  }

  /// A view on a region which the DMA engine has
  /// finished writing.
  ///
  /// Out of range requests are clipped.
  pub fn region(&self, offset : usize, len : usize) -> &[u8] {
    let start = offset.min(self.len);
    let end   = (offset + len).min(self.len);
    fence(Ordering::Acquire);
    // completed regions are not written again until the
    // buffer is handed back to the bus master
    unsafe {
      std::slice::from_raw_parts(self.ptr.add(start), end - start)
    }
  }
}
