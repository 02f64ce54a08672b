//! Resilience utilities.

pub mod retry;
