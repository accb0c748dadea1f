pub mod addr;
pub mod client;
pub mod command;
pub mod error;
pub mod proto;

// Re-export key types for easier access by consumers
pub use client::PeerClient;
pub use command::{CommandKind, SegmentCommand, Tunnel};
pub use error::ErrorKind;
pub use proto::PskConfig;
