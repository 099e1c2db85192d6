//! QEMU monitor access.
//!
//! - `PromptFramer`: incremental response framing on the `(qemu) ` prompt
//! - `MonitorChannel`: one request/response exchange at a time over the
//!   monitor connection
//! - `MonitorProxy`: background task that owns the channel and serves
//!   short-lived clients on a Unix socket
//! - `MonitorClient`: one-shot client of the proxy (host side or through the
//!   guest's reverse tunnel)

mod channel;
mod client;
mod framer;
mod proxy;

pub use channel::MonitorChannel;
pub use client::{MonitorClient, MonitorEndpoint};
pub use framer::{strip_prompt, PromptFramer, MONITOR_PROMPT};
pub use proxy::{MonitorProxy, MonitorProxyHandle};

/// Read size for monitor and proxy sockets. Proxy requests longer than this
/// are truncated.
pub const MONITOR_CHUNK_SIZE: usize = 1024;
