pub mod client;
pub mod server;

pub use client::{NodeTransport, PeerHandle};
