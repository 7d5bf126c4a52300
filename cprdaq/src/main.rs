//! # cprdaq
//!
//! Data collection from the COPPER readout board. Opens the
//! data node, writes every event (header, record, footer) to
//! a file and nudges the DMA whenever nothing arrives for a
//! while. Ctrl+C ends the run, everything which is already
//! in the buffers is still written out.
//!
//! Without the board, `--simulate` runs the whole pipeline
//! against a software COPPER which gets fed with events.

use std::fs::File;
use std::io::{
  self,
  BufWriter,
  Write,
};
use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{
  AtomicBool,
  Ordering,
};
use std::thread;
use std::time::Duration;

#[macro_use] extern crate log;

extern crate clap;
use clap::Parser;

use chrono::Utc;
use colored::Colorize;
use indicatif::{
  ProgressBar,
  ProgressStyle,
};

use cprdaq_lib::{
  init_env_logger,
  DriverSettings,
};
use cprdaq_lib::device::{
  Driver,
  ReadPhase,
  COPPER_MINOR,
};
use cprdaq_lib::errors::DeviceError;
use cprdaq_lib::ioctl::{
  IoctlArg,
  CPRIO_END_RUN,
  CPRIO_FORCE_DMA,
  CPRIO_SET_CRATE,
  CPRIO_SET_SLOT,
  CPRIO_SET_SUBSYS,
};
use cprdaq_lib::memory::UioBridge;
use cprdaq_lib::sim::SimulatedCopper;

#[derive(Parser, Debug)]
#[command(author = "cprdaq developers", version, about, long_about = None)]
struct Args {
  /// Settings (toml). Defaults are used if not given
  #[arg(short, long)]
  config: Option<String>,
  /// Write the settings in use to this file and exit
  #[arg(long)]
  write_config: Option<String>,
  /// Output file, "-" for stdout. Default is a
  /// file named after the start time
  #[arg(short, long)]
  output: Option<String>,
  /// End the run after this many events (0 - until Ctrl+C)
  #[arg(short, long, default_value_t = 0)]
  nevents: u64,
  /// Force a DMA if no event arrived within this time
  #[arg(long, default_value_t = 1000)]
  timeout_ms: u64,
  /// Overrides the subsystem id of the settings
  #[arg(long)]
  subsys: Option<u32>,
  /// Overrides the crate number of the settings
  #[arg(long = "crate")]
  crate_: Option<u32>,
  /// Overrides the slot number of the settings
  #[arg(long)]
  slot: Option<u32>,
  /// Run against the software COPPER
  #[arg(long, default_value_t = false)]
  simulate: bool,
  /// Event rate of the software COPPER (Hz)
  #[arg(long, default_value_t = 1000)]
  sim_rate: u64,
  /// Show a progress bar with the number of events
  #[arg(long, default_value_t = false)]
  show_progress: bool,
}

/// Deliver events to the software COPPER
fn feed_simulation(sim : Arc<SimulatedCopper>, rate : u64, stop : Arc<AtomicBool>) {
  let pause     = Duration::from_micros(1_000_000 / rate.max(1));
  let mut count = 0u32;
  while !stop.load(Ordering::Relaxed) {
    let n_words = 8 + count % 32;
    let payload : Vec<u32> = (0..2*n_words).map(|k| (count << 16) | k).collect();
    sim.push_record([n_words, n_words, 0, 0], &payload);
    count = count.wrapping_add(1);
    thread::sleep(pause);
  }
  info!("Software COPPER delivered {} events", count);
}

fn main() {
  init_env_logger();
  let args = Args::parse();

  let mut settings = match &args.config {
    None => DriverSettings::new(),
    Some(fname) => {
      match DriverSettings::from_toml(fname) {
        Err(err) => {
          error!("Unable to read settings from {}! {}", fname, err);
          exit(1);
        }
        Ok(settings) => settings
      }
    }
  };
  if let Some(subsys) = args.subsys {
    settings.module.subsys = subsys;
  }
  if let Some(crate_) = args.crate_ {
    settings.module.crate_ = crate_;
  }
  if let Some(slot) = args.slot {
    settings.module.slot = slot;
  }
  if let Some(fname) = args.write_config {
    match settings.to_toml(fname) {
      Err(err) => {
        error!("Unable to write settings! {err}");
        exit(1);
      }
      Ok(_) => {
        println!("=> Settings written!");
        return;
      }
    }
  }
  info!("Using {}", settings);

  // load the driver
  let mut sim    : Option<Arc<SimulatedCopper>> = None;
  let driver = if args.simulate {
    let copper = Arc::new(SimulatedCopper::new());
    let driver = match Driver::load(copper.clone(), copper.clone(), &settings) {
      Err(err) => {
        error!("Unable to load the driver! {err}");
        exit(1);
      }
      Ok(driver) => driver
    };
    copper.map_windows(driver.dma_windows());
    sim = Some(copper);
    driver
  } else {
    let bridge = match UioBridge::new(&settings.register_device) {
      Err(err) => {
        error!("Unable to map {}! {}", settings.register_device, err);
        exit(1);
      }
      Ok(bridge) => Arc::new(bridge)
    };
    match Driver::load(bridge.clone(), bridge, &settings) {
      Err(err) => {
        error!("Unable to load the driver! {err}");
        exit(1);
      }
      Ok(driver) => driver
    }
  };

  let mut session = match driver.open(COPPER_MINOR) {
    Err(err) => {
      error!("Unable to open the data node! {err}");
      exit(1);
    }
    Ok(session) => session
  };
  let identity = [(CPRIO_SET_SUBSYS, settings.module.subsys),
                  (CPRIO_SET_CRATE,  settings.module.crate_),
                  (CPRIO_SET_SLOT,   settings.module.slot)];
  for (cmd, value) in identity {
    if let Err(err) = session.ioctl(cmd, IoctlArg::Value(value)) {
      error!("Unable to set module identity! {err}");
    }
  }

  let terminate = Arc::new(AtomicBool::new(false));
  if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGINT, terminate.clone()) {
    error!("Unable to install the SIGINT handler! {err}");
  }

  let feeder_stop = Arc::new(AtomicBool::new(false));
  let mut feeder  = None;
  if let Some(copper) = sim.clone() {
    let stop = feeder_stop.clone();
    let rate = args.sim_rate;
    match thread::Builder::new()
      .name("sim-feeder".into())
      .spawn(move || feed_simulation(copper, rate, stop)) {
      Err(err) => error!("Failed to spawn the feeder thread! {err}"),
      Ok(handle) => feeder = Some(handle)
    }
  }

  let fname = args.output.unwrap_or(format!("cpr_{}.dat", Utc::now().format("%Y_%m_%d-%H_%M_%S")));
  let mut writer : Box<dyn Write> = if fname == "-" {
    Box::new(BufWriter::new(io::stdout()))
  } else {
    match File::create(&fname) {
      Err(err) => {
        error!("Unable to create {}! {}", fname, err);
        exit(1);
      }
      Ok(file) => {
        println!("=> Writing events to {}", fname.green());
        Box::new(BufWriter::new(file))
      }
    }
  };

  let bar = if args.show_progress {
    let bar = if args.nevents > 0 {
      ProgressBar::new(args.nevents)
    } else {
      ProgressBar::new_spinner()
    };
    let template = "[{elapsed_precise}] {spinner} {bar:60.blue/grey} {pos:>7} events {msg}";
    match ProgressStyle::with_template(template) {
      Err(err) => error!("Unable to set progressbar style! {err}"),
      Ok(style) => bar.set_style(style),
    }
    bar
  } else {
    ProgressBar::hidden()
  };

  let timeout       = Duration::from_millis(args.timeout_ms);
  let mut buf       = vec![0u8; settings.dma_buffer_size() + 1024];
  let mut n_events  = 0u64;
  let mut n_bytes   = 0u64;
  let mut n_forced  = 0u64;
  let mut ending    = false;
  loop {
    if !ending && (terminate.load(Ordering::Relaxed)
                   || (args.nevents > 0 && n_events >= args.nevents)) {
      println!("=> {}", "Ending the run, draining the buffers..".yellow());
      if let Err(err) = session.ioctl(CPRIO_END_RUN, IoctlArg::None) {
        error!("Unable to end the run! {err}");
      }
      ending = true;
    }
    if session.phase() == ReadPhase::Start && !session.poll(timeout) && !ending {
      // the watchdog, maybe we missed an interrupt
      debug!("No event within {:?}, forcing DMA", timeout);
      if let Err(err) = session.ioctl(CPRIO_FORCE_DMA, IoctlArg::None) {
        error!("Force DMA failed! {err}");
      }
      n_forced += 1;
      continue;
    }
    match session.read(&mut buf) {
      Err(DeviceError::Interrupted) => continue,
      Err(err) => {
        error!("Read failed! {err}");
        break;
      }
      Ok(0) => {
        info!("End of run");
        break;
      }
      Ok(n) => {
        if let Err(err) = writer.write_all(&buf[..n]) {
          error!("Unable to write {} bytes! {}", n, err);
          break;
        }
        n_bytes += n as u64;
        if session.phase() == ReadPhase::Start {
          n_events += 1;
          bar.inc(1);
        }
      }
    }
  }
  bar.finish();
  if let Err(err) = writer.flush() {
    error!("Unable to flush the output! {err}");
  }

  feeder_stop.store(true, Ordering::Relaxed);
  if let Some(handle) = feeder {
    if handle.join().is_err() {
      error!("Feeder thread did not end cleanly!");
    }
  }
  println!("=> {} events ({} bytes), {} forced DMA", n_events, n_bytes, n_forced);
  println!("{}", driver.pipeline().status());
  drop(session);
  driver.unload();
}
