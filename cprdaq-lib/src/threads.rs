pub mod interrupt;
pub mod worker;

pub use interrupt::{
  top_half,
  interrupt_listener,
  InterruptStatus,
  IrqReturn,
};
pub use worker::{
  bottom_half,
  deferred_worker,
};
