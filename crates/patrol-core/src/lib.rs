//! Core library for the patrol host agent.
//!
//! This crate holds everything below the IPC surface of the daemon:
//!
//! - [`ec`]: the Embedded Controller subsystem — the port bus, the EMI
//!   register-window transport, and the single-threaded command manager.
//! - [`framing`]: the authenticated secure packet codec used on the local
//!   sockets (HMAC-SHA256, optional encrypt-then-MAC payload cipher).
//! - [`session`]: per-connection session state — token minting, sequence
//!   validation, replay rejection.
//! - [`action`]: the action command queue with correlated request/result
//!   rendezvous.
//! - [`bezel`]: the bezel input poller that turns EC register changes into
//!   action events.
//! - [`config`]: daemon configuration.
//! - [`secret`]: the machine shared secret and key derivation.
//!
//! The daemon binary in `patrol-daemon` wires these together; nothing in
//! this crate touches a socket.

pub mod action;
pub mod bezel;
pub mod config;
pub mod ec;
pub mod framing;
pub mod secret;
pub mod session;

pub use action::{ActionCommand, ActionKind, ActionQueue, ActionResult};
pub use config::PatrolConfig;
pub use framing::{PacketHeader, Role, SecureCodec};
pub use secret::SharedSecret;
pub use session::{Session, SessionHandle, SessionTable};
