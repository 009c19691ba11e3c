//! Ethernet-over-vsock bridge for enclaves.
//!
//! An enclave has no NIC. This crate gives it one: a TAP device whose frames
//! are relayed over a single vsock stream to a host-side proxy
//! (gvproxy-style), which runs the actual network stack.
//!
//! - **tun**: TAP device creation and async I/O
//! - **tokio**: vsock stream, forwarding tasks, `ip` commands
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        tunnel-vsock                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TAP Device ◄──► [u16 LE len][frame] ◄──► vsock ◄──► Proxy  │
//! ├─────────────────────────────────────────────────────────────┤
//! │     Supervisor: connect, configure, forward, retry          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("tunnel-vsock only supports Linux");

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod forwarder;
pub mod resolver;
pub mod session;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use session::{SessionBackend, VsockTapBackend};
pub use supervisor::{StopSignal, Supervisor, SupervisorState, SupervisorStats};
