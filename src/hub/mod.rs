//! Session hub module
//!
//! Connection registry, per-connection session state machine, message
//! router, outbound backpressure and liveness monitoring.

mod error;
mod liveness;
mod manager;
mod message;
mod queue;
mod registry;
mod router;
mod session;

pub use error::*;
pub use liveness::*;
pub use manager::*;
pub use message::*;
pub use queue::*;
#[allow(unused_imports)]
pub use registry::*;
#[allow(unused_imports)]
pub use router::DeliveryReport;
pub use session::*;
