//! Domain types and ports

pub mod events;
pub mod key;
pub mod ports;

pub use events::ResourceChange;
pub use key::ClaimKey;
