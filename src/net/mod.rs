//! §4.4 Net endpoint: framed/raw I/O over a non-blocking `mio` socket,
//! with bandwidth gating and idle/keepalive timers.

pub mod endpoint;
pub mod tls;

pub use endpoint::{Endpoint, RecvOutcome};
