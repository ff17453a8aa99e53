//! rfidlib-engine: the machinery shared by both reader dialects.
//!
//! - [`framing`]: splitting the byte stream into lines on a switchable
//!   separator
//! - [`command`]: command parameters, with absent optional parameters left
//!   out of the wire form
//! - [`io`]: the single task that owns the transport
//! - [`session`]: status, reply queue and command lock, callbacks, events,
//!   inventory aggregation and the configuration snapshot
//! - [`dialect`]: the [`Dialect`] trait a wire dialect implements
//! - [`lifecycle`]: [`Engine`], which connects, configures (with retry),
//!   watches liveness and disconnects

pub mod command;
pub mod dialect;
pub mod framing;
pub mod io;
pub mod lifecycle;
pub mod session;

pub use command::{CommandParam, Hex2, render_params};
pub use dialect::Dialect;
pub use lifecycle::{Engine, EngineConfig};
pub use session::{Exchange, Session};
