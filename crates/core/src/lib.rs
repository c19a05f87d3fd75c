//! `herald-core`: scheduling math and time-slot keys.
//!
//! This crate is **pure**: no I/O, no clocks, no runtime. Callers pass the
//! current time in.

pub mod schedule;
pub mod slot;

pub use slot::SlotKey;
