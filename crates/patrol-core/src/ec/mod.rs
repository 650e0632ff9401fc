//! Embedded Controller subsystem.
//!
//! Layered bottom-up:
//!
//! - [`port`]: byte-level access to 8-bit I/O ports under a process-wide
//!   lock.
//! - [`wire`]: the EC host-command frame model — headers, checksum,
//!   command catalog, typed payload records.
//! - [`transport`]: one command/response transaction over the 13-register
//!   EMI window, including handshake, deferred-completion polling, and
//!   retries.
//! - [`manager`]: the single worker thread that owns the transaction
//!   queue and exposes the synchronous and asynchronous call contracts.
//! - [`sim`]: an in-process EC simulator that implements the same window
//!   protocol against scripted firmware, used by tests and by hosts
//!   without the hardware.
//!
//! All port traffic flows through exactly one worker thread; nothing else
//! in the process touches the window.

pub mod manager;
pub mod port;
pub mod sim;
pub mod status;
pub mod transport;
pub mod wire;

pub use manager::{EcManager, EcStats};
pub use port::{PortBus, PortError, RawPortBus};
pub use sim::{Firmware, SimulatedEc};
pub use status::EcStatus;
pub use transport::EcTransport;
