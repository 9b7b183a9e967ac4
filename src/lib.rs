//! TeenyBASIC compiler back-end: a constant folder, a taint-tracking
//! statement optimizer, a frequency-based register allocator, and an x86-64
//! System V instruction emitter. See `src/bin` for the CLI driver.

pub mod back;
pub mod common;
pub mod front;
pub mod middle;
