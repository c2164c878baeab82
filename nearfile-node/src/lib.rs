//! Nearby file transfer node: discovery, pairing, and file transfer over a LAN
//! datagram link or a point-to-point radio link.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod events;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use events::SessionEvent;
pub use session::SessionController;
