pub mod engine;

#[cfg(any(feature = "client", feature = "server"))]
pub mod net;
