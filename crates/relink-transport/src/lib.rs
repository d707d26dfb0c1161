#![warn(missing_docs)]

//! relink transport engine: host rotation and failover, HTTP carrier,
//! local pipe carrier.
//!
//! The engine moves an agent's outbound envelopes to a controller and back
//! over one of two substitutable carriers, surviving host outages, proxy
//! changes and peer disconnects. Payload encryption and the command
//! protocol on top are collaborators, not concerns of this crate.

pub mod cipher;
pub mod config;
pub mod error;
pub mod frame;
pub mod hosts;
pub mod http;
pub mod identity;
pub mod pipe;
pub mod proxy;
pub mod transport;

pub use error::{Result, TransportError};
pub use transport::Transport;
