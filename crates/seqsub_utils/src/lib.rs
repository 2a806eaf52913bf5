//! seqsub_utils
//!
//! Shared utilities for the seqsub workspace. Currently this is just the
//! logging bootstrap; anything that more than one crate needs but that does
//! not belong to the broker, bus or store lives here.

pub mod logging;
