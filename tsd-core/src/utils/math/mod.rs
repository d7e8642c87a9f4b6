//! Math utilities for the pulse engine.
//!
//! This module provides the velocity to timing conversion and both rate strategies.

pub mod rate;
