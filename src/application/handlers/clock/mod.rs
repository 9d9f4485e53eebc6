//! Simulated clock handlers.

mod simulated_clock;

pub use simulated_clock::SimulatedClockHandler;
