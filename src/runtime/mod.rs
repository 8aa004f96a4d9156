//! Single-threaded readiness runtime for the relay.
//!
//! - `event_loop`: mio reactor owning the listener, connections and store
//! - `connection`: per-connection buffers and slab registry
//! - `request`: frame/payload state machine and command dispatch

mod connection;
mod event_loop;
mod request;

pub use event_loop::EventLoop;

use crate::config::Config;
use crate::storage::Store;

/// Run the server until its event loop stops.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(&config, Store::new())?;
    event_loop.run()
}
