//! Control opcodes of the device nodes
//!
//! The opcodes use the Linux ioctl encoding:
//!
//! ```text
//! bits 31-30 : direction (none, write, read)
//! bits 29-16 : argument size
//! bits 15-8  : type (magic)
//! bits  7-0  : number
//! ```
//!
//! Registers are read/written by using their offset as
//! number. COPPER registers at 0x100 and above use the
//! second magic, with number = offset - 0x100.

use std::fmt;

use crate::constants::SIZEOF_U32;
use crate::errors::DeviceError;

pub const IOC_NONE  : u32 = 0;
pub const IOC_WRITE : u32 = 1;
pub const IOC_READ  : u32 = 2;

const IOC_NRSHIFT   : u32 = 0;
const IOC_TYPESHIFT : u32 = 8;
const IOC_SIZESHIFT : u32 = 16;
const IOC_DIRSHIFT  : u32 = 30;
const IOC_SIZEMASK  : u32 = (1 << 14) - 1;

/// Data node, registers below 0x100 and commands
pub const COPPER_MAGIC  : u8 = b'C';
/// Data node, registers from 0x100 on
pub const COPPER_MAGIC2 : u8 = b'D';
/// Bridge node
pub const PLX9054_MAGIC : u8 = b'P';

pub const fn ioc(dir : u32, ty : u8, nr : u8, size : u32) -> u32 {
  (dir << IOC_DIRSHIFT)
    | ((size & IOC_SIZEMASK) << IOC_SIZESHIFT)
    | ((ty as u32) << IOC_TYPESHIFT)
    | ((nr as u32) << IOC_NRSHIFT)
}

pub const fn io(ty : u8, nr : u8) -> u32 {
  ioc(IOC_NONE, ty, nr, 0)
}

pub const fn ior(ty : u8, nr : u8) -> u32 {
  ioc(IOC_READ, ty, nr, SIZEOF_U32 as u32)
}

pub const fn iow(ty : u8, nr : u8) -> u32 {
  ioc(IOC_WRITE, ty, nr, SIZEOF_U32 as u32)
}

pub fn ioc_dir(cmd : u32) -> u32 {
  cmd >> IOC_DIRSHIFT
}

pub fn ioc_type(cmd : u32) -> u8 {
  ((cmd >> IOC_TYPESHIFT) & 0xff) as u8
}

pub fn ioc_nr(cmd : u32) -> u8 {
  ((cmd >> IOC_NRSHIFT) & 0xff) as u8
}

pub fn ioc_size(cmd : u32) -> u32 {
  (cmd >> IOC_SIZESHIFT) & IOC_SIZEMASK
}

pub const CPRIO_RESET_FINESSE     : u32 = io(COPPER_MAGIC, 1);
pub const CPRIO_INIT_RUN          : u32 = io(COPPER_MAGIC, 2);
pub const CPRIO_RESET_COPPER      : u32 = io(COPPER_MAGIC, 3);
pub const CPRIO_FORCE_DMA         : u32 = io(COPPER_MAGIC, 4);
pub const CPRIO_END_RUN           : u32 = io(COPPER_MAGIC, 5);
pub const CPRIO_SET_SUBSYS        : u32 = io(COPPER_MAGIC, 6);
pub const CPRIO_SET_CRATE         : u32 = io(COPPER_MAGIC, 7);
pub const CPRIO_SET_SLOT          : u32 = io(COPPER_MAGIC, 8);
pub const CPRIO_ENABLE_INTERRUPT  : u32 = io(COPPER_MAGIC, 9);
pub const CPRIO_DISABLE_INTERRUPT : u32 = io(COPPER_MAGIC, 10);

pub const PLXIO_CLEAR_DMA         : u32 = io(PLX9054_MAGIC, 1);

/// Opcode to read a COPPER register
pub fn copper_read_cmd(offset : u32) -> u32 {
  if offset >= 0x100 {
    ior(COPPER_MAGIC2, (offset - 0x100) as u8)
  } else {
    ior(COPPER_MAGIC, offset as u8)
  }
}

/// Opcode to write a COPPER register
pub fn copper_write_cmd(offset : u32) -> u32 {
  if offset >= 0x100 {
    iow(COPPER_MAGIC2, (offset - 0x100) as u8)
  } else {
    iow(COPPER_MAGIC, offset as u8)
  }
}

pub fn plx9054_read_cmd(offset : u32) -> u32 {
  ior(PLX9054_MAGIC, offset as u8)
}

pub fn plx9054_write_cmd(offset : u32) -> u32 {
  iow(PLX9054_MAGIC, offset as u8)
}

/// The argument which comes with an opcode
#[derive(Debug)]
pub enum IoctlArg<'a> {
  None,
  /// Passed by value (SET_SUBSYS etc.)
  Value(u32),
  /// User memory, registers are read into/
  /// written from the first 4 bytes
  Buffer(&'a mut [u8]),
}

impl<'a> IoctlArg<'a> {
  /// The value for a register write
  pub fn read_u32(&self) -> Result<u32, DeviceError> {
    match self {
      IoctlArg::Buffer(buf) if buf.len() >= SIZEOF_U32 => {
        Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
      }
      IoctlArg::Value(v) => Ok(*v),
      _ => Err(DeviceError::Fault)
    }
  }

  /// Hand a register value to the caller
  pub fn write_u32(&mut self, value : u32) -> Result<(), DeviceError> {
    match self {
      IoctlArg::Buffer(buf) if buf.len() >= SIZEOF_U32 => {
        buf[0..SIZEOF_U32].copy_from_slice(&value.to_le_bytes());
        Ok(())
      }
      _ => Err(DeviceError::Fault)
    }
  }

  /// Argument of the SET_XXX commands
  pub fn value(&self) -> Result<u32, DeviceError> {
    match self {
      IoctlArg::Value(v) => Ok(*v),
      IoctlArg::Buffer(_) => self.read_u32(),
      IoctlArg::None => Err(DeviceError::InvalidArgument),
    }
  }
}

/// Opcodes of the data node
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CopperCommand {
  ReadRegister(u32),
  WriteRegister(u32),
  ResetFinesse,
  InitRun,
  ResetCopper,
  ForceDma,
  EndRun,
  SetSubsys,
  SetCrate,
  SetSlot,
  EnableInterrupt,
  DisableInterrupt,
}

impl CopperCommand {
  pub fn decode(cmd : u32) -> Result<Self, DeviceError> {
    let ty     = ioc_type(cmd);
    let mut nr = ioc_nr(cmd) as u32;
    if ty == COPPER_MAGIC2 {
      nr += 0x100;
    } else if ty != COPPER_MAGIC {
      return Err(DeviceError::InvalidArgument);
    }
    let dir = ioc_dir(cmd);
    if dir & IOC_READ != 0 {
      return Ok(CopperCommand::ReadRegister(nr));
    }
    if dir & IOC_WRITE != 0 {
      return Ok(CopperCommand::WriteRegister(nr));
    }
    match cmd {
      CPRIO_RESET_FINESSE     => Ok(CopperCommand::ResetFinesse),
      CPRIO_INIT_RUN          => Ok(CopperCommand::InitRun),
      CPRIO_RESET_COPPER      => Ok(CopperCommand::ResetCopper),
      CPRIO_FORCE_DMA         => Ok(CopperCommand::ForceDma),
      CPRIO_END_RUN           => Ok(CopperCommand::EndRun),
      CPRIO_SET_SUBSYS        => Ok(CopperCommand::SetSubsys),
      CPRIO_SET_CRATE         => Ok(CopperCommand::SetCrate),
      CPRIO_SET_SLOT          => Ok(CopperCommand::SetSlot),
      CPRIO_ENABLE_INTERRUPT  => Ok(CopperCommand::EnableInterrupt),
      CPRIO_DISABLE_INTERRUPT => Ok(CopperCommand::DisableInterrupt),
      _ => Err(DeviceError::InvalidArgument)
    }
  }
}

impl fmt::Display for CopperCommand {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<CopperCommand: {:?}>", self)
  }
}

/// Opcodes of the bridge node
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Plx9054Command {
  ReadRegister(u32),
  WriteRegister(u32),
  ClearDma,
}

impl Plx9054Command {
  pub fn decode(cmd : u32) -> Result<Self, DeviceError> {
    if ioc_type(cmd) != PLX9054_MAGIC {
      return Err(DeviceError::InvalidArgument);
    }
    let nr  = ioc_nr(cmd) as u32;
    let dir = ioc_dir(cmd);
    if dir & IOC_READ != 0 {
      return Ok(Plx9054Command::ReadRegister(nr));
    }
    if dir & IOC_WRITE != 0 {
      return Ok(Plx9054Command::WriteRegister(nr));
    }
    match cmd {
      PLXIO_CLEAR_DMA => Ok(Plx9054Command::ClearDma),
      _ => Err(DeviceError::InvalidArgument)
    }
  }
}

#[cfg(test)]
mod test_ioctl {
  use super::*;
  use crate::registers::{
    LEF_TOTAL,
    FF_DMA,
    DMACSR0,
  };

  #[test]
  fn linux_encoding() {
    // _IOR('C', 0x0c, unsigned int)
    assert_eq!(copper_read_cmd(LEF_TOTAL), 0x8004430c);
    // _IO('C', 2)
    assert_eq!(CPRIO_INIT_RUN, 0x4302);
    assert_eq!(ioc_size(copper_write_cmd(LEF_TOTAL)), 4);
  }

  #[test]
  fn decode_copper() {
    assert_eq!(CopperCommand::decode(copper_read_cmd(LEF_TOTAL)),
               Ok(CopperCommand::ReadRegister(LEF_TOTAL)));
    assert_eq!(CopperCommand::decode(copper_write_cmd(FF_DMA)),
               Ok(CopperCommand::WriteRegister(FF_DMA)));
    assert_eq!(CopperCommand::decode(CPRIO_END_RUN), Ok(CopperCommand::EndRun));
    assert_eq!(CopperCommand::decode(io(COPPER_MAGIC, 99)), Err(DeviceError::InvalidArgument));
    assert_eq!(CopperCommand::decode(PLXIO_CLEAR_DMA), Err(DeviceError::InvalidArgument));
  }

  #[test]
  fn decode_plx9054() {
    assert_eq!(Plx9054Command::decode(plx9054_read_cmd(DMACSR0)),
               Ok(Plx9054Command::ReadRegister(DMACSR0)));
    assert_eq!(Plx9054Command::decode(PLXIO_CLEAR_DMA), Ok(Plx9054Command::ClearDma));
    assert_eq!(Plx9054Command::decode(CPRIO_INIT_RUN), Err(DeviceError::InvalidArgument));
  }

  #[test]
  fn short_buffer_is_a_fault() {
    let mut small = [0u8; 2];
    let mut arg   = IoctlArg::Buffer(&mut small);
    assert_eq!(arg.write_u32(1), Err(DeviceError::Fault));
    let mut word = [0u8; 4];
    let mut arg  = IoctlArg::Buffer(&mut word);
    assert!(arg.write_u32(0xdeadbeef).is_ok());
    assert_eq!(arg.read_u32(), Ok(0xdeadbeef));
  }
}
