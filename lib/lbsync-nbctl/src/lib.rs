//! Backend store over the northbound control utility
//!
//! This library provides:
//! - A command runner that invokes the utility with a bounded timeout
//! - Parsers for VIP maps, reject-rule listings and bare column output
//! - `NbctlStore`, implementing the backend store and gateway set contracts

pub mod client;
pub mod error;
pub mod parse;
pub mod store;

pub use client::{CommandRunner, NbctlClient};
pub use error::{NbctlError, Result};
pub use store::NbctlStore;
