//! Shared infrastructure for tftpsim integration tests

pub mod fixtures;
