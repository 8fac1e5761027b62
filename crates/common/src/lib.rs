//! Common types shared by the key pool crates and the bot service

mod error;
mod fingerprint;
mod secret;

pub use error::{Error, Result};
pub use fingerprint::fingerprint;
pub use secret::Secret;
