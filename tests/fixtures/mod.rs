//! Test fixtures

mod transfer_fixture;

pub use transfer_fixture::{FixtureError, TransferFixture, fast_socket, pattern};
