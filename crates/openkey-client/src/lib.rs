//! HTTP and file plumbing for the credential pool
//!
//! Thin, dependency-light calls to the outside world. Nothing here knows about
//! pool policy; the bot service wraps these functions in the `upstream` traits.
//!
//! - `billing::probe_subscription()` asks the credential upstream whether a
//!   bearer token is still accepted and returns the raw status and body
//! - `kv::KvClient` talks to a Cloudflare Workers KV namespace (the mirror)
//! - `inbox::TokenInbox` drains a drop file that acquisition scripts append to

pub mod billing;
pub mod constants;
pub mod error;
pub mod inbox;
pub mod kv;

pub use billing::{ProbeReply, probe_subscription};
pub use constants::*;
pub use error::{Error, Result};
pub use inbox::TokenInbox;
pub use kv::KvClient;
