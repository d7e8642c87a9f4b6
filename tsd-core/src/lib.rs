//! Tick-driven stepper pulse engine for no-std embedded platforms.
//!
//! For a runnable host simulation, see `tsd-app/mock-mcu`.
#![no_std]

pub mod utils;
