//! NAT Rendezvous Library
//!
//! Lets two peers behind independent NATs exchange UDP messages through a
//! public rendezvous server: a TCP coordination channel, a UDP relay channel
//! that learns each client's post-NAT address from observed traffic, and the
//! peer-side agent that drives both.

pub mod client;
pub mod coordinator;
pub mod directory;
pub mod health;
pub mod protocol;
pub mod relay;

pub use client::*;
pub use coordinator::*;
pub use directory::*;
pub use protocol::*;
pub use relay::*;
