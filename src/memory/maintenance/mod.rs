//! Background maintenance for session state.

pub mod idle_sweep;

pub use idle_sweep::{IdleSweeper, SweepStats};
