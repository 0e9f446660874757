//! # tftpsim Faults
//!
//! Fault injection for tftpsim transfers.
//!
//! This crate provides:
//! - The [`stream::DatagramStream`] abstraction and its UDP base
//! - One-shot fault decorators: drop, delay, duplicate, modify and
//!   wrong-sender
//! - [`fault::FaultSpec`] for choosing a fault by packet number
//! - The [`relay::Relay`] that sits between a client and a server and
//!   applies the chosen fault to each session

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delay;
pub mod drop;
pub mod duplicate;
pub mod fault;
pub mod modify;
pub mod relay;
pub mod stream;
pub mod wrong_sender;

pub use delay::DelayFault;
pub use drop::DropFault;
pub use duplicate::{DuplicateFault, RequestSpawner};
pub use fault::{FaultError, FaultKind, FaultResult, FaultSpec};
pub use modify::{ModifyFault, PacketModifier};
pub use relay::{Relay, RelayConfig, SessionEnd};
pub use stream::{DatagramStream, PacketCounter, Sequenced, SharedStream, UdpStream};
pub use wrong_sender::WrongSenderFault;
