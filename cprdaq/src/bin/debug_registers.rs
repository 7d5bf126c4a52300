//! Dump the COPPER and PLX9054 registers through
//! the ioctl passthrough of the device nodes.
//!
//! The data node is only opened if no FINESSE node
//! is available, since opening it starts a new run.

use std::process::exit;
use std::sync::Arc;

#[macro_use] extern crate log;

extern crate clap;
use clap::Parser;

use colored::Colorize;

use cprdaq_lib::{
  init_env_logger,
  DriverSettings,
};
use cprdaq_lib::constants::N_FINESSE;
use cprdaq_lib::device::{
  Driver,
  Session,
  COPPER_MINOR,
};
use cprdaq_lib::ioctl::{
  copper_read_cmd,
  plx9054_read_cmd,
  IoctlArg,
};
use cprdaq_lib::memory::UioBridge;
use cprdaq_lib::registers::{
  COPPER_NAMED_REGISTERS,
  PLX9054_NAMED_REGISTERS,
};
use cprdaq_lib::sim::SimulatedCopper;

#[derive(Parser, Debug)]
#[command(author = "cprdaq developers", version, about, long_about = None)]
struct Args {
  /// Settings (toml), for the UIO device
  #[arg(short, long)]
  config: Option<String>,
  /// Look at the software COPPER instead
  #[arg(long, default_value_t = false)]
  simulate: bool,
}

fn open_any(driver : &Driver) -> Option<Session> {
  for minor in 1..=N_FINESSE {
    if let Ok(session) = driver.open(minor) {
      return Some(session);
    }
  }
  match driver.open(COPPER_MINOR) {
    Err(err) => {
      error!("Unable to open any node! {err}");
      None
    }
    Ok(session) => Some(session)
  }
}

fn main() {
  init_env_logger();
  let args = Args::parse();
  let settings = match &args.config {
    None        => DriverSettings::new(),
    Some(fname) => DriverSettings::from_toml(fname).unwrap_or_else(|err| {
      error!("Unable to read settings from {}! {}", fname, err);
      exit(1);
    })
  };

  let loaded = if args.simulate {
    let sim = Arc::new(SimulatedCopper::new());
    Driver::load(sim.clone(), sim, &settings)
  } else {
    match UioBridge::new(&settings.register_device) {
      Err(err) => Err(err),
      Ok(bridge) => {
        let bridge = Arc::new(bridge);
        Driver::load(bridge.clone(), bridge, &settings)
      }
    }
  };
  let driver = match loaded {
    Err(err) => {
      error!("Unable to load the driver! {err}");
      exit(1);
    }
    Ok(driver) => driver
  };

  let mut session = match open_any(&driver) {
    None => exit(1),
    Some(session) => session
  };
  println!("=> {} (minor {})", "COPPER".bold(), session.minor());
  for (name, offset) in COPPER_NAMED_REGISTERS {
    let mut value = [0u8; 4];
    match session.ioctl(copper_read_cmd(offset), IoctlArg::Buffer(&mut value)) {
      Err(err) => println!("  {:<12} [{:#05x}] : {}", name, offset, err.to_string().red()),
      Ok(_)    => println!("  {:<12} [{:#05x}] : {:#010x}", name, offset, u32::from_le_bytes(value)),
    }
  }

  let plx = driver.open_bridge();
  println!("=> {}", "PLX9054".bold());
  for (name, offset) in PLX9054_NAMED_REGISTERS {
    let mut value = [0u8; 4];
    match plx.ioctl(plx9054_read_cmd(offset), IoctlArg::Buffer(&mut value)) {
      Err(err) => println!("  {:<12} [{:#05x}] : {}", name, offset, err.to_string().red()),
      Ok(_)    => println!("  {:<12} [{:#05x}] : {:#010x}", name, offset, u32::from_le_bytes(value)),
    }
  }
  println!("{}", driver.pipeline().status());
  drop(session);
  driver.unload();
}
