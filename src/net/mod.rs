use std::{sync::Arc, time::Duration};

mod error;
pub mod tls;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod endpoint;

pub use error::Error;

pub const DEFAULT_PORT: u16 = 4712;

/// Largest request the server will read off a stream.
pub const MAX_REQUEST_BYTES: usize = 64 << 20;

/// Largest reply a client will read off a stream.
pub const MAX_REPLY_BYTES: usize = 16 << 20;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Transport settings shared by the server and client sides.
fn transport_config(keep_alive: Option<Duration>) -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(keep_alive);
    Arc::new(transport)
}
