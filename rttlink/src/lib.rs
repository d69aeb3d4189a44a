//! Host side implementation of the RTT (Real-Time Transfer) I/O protocol, driven by polling target
//! memory through a debug probe.
//!
//! RTT implements input and output to/from a microcontroller using in-memory ring buffers and
//! memory polling. The host has no other way to talk to the target: it finds the control block by
//! scanning RAM, then moves bytes by reading and writing the ring buffer offsets the target
//! firmware maintains.
//!
//! The debug probe is abstracted behind [`Transport`] and [`Connection`]. A [`Session`] opens a
//! fresh connection on every tick, because the transport gives no liveness signal and reopening is
//! the only reliable way to notice a target that went away.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "probe-rs")]
//! # {
//! use rttlink::{CancellationToken, OutboundQueue, ProbeRsTransport, Session, SessionConfig};
//!
//! let transport = ProbeRsTransport::default();
//! let queue = OutboundQueue::new(1024);
//! let input = queue.bridge();
//! let cancel = CancellationToken::new();
//!
//! let mut session = Session::new(transport, SessionConfig::default(), queue, cancel.clone());
//!
//! input.push(b"hello target\n");
//!
//! // Runs until `cancel.cancel()` is called from another thread or a signal handler.
//! session.run(&mut std::io::stdout())?;
//! # }
//! # Ok::<(), rttlink::Error>(())
//! ```

use thiserror::Error;

mod channel;
pub use channel::*;

mod config;
pub use config::*;

mod control_block;
pub use control_block::*;

pub mod memory;
pub use memory::{Connection, MemoryExt, ProbeMode, Transport};

mod queue;
pub use queue::*;

mod session;
pub use session::*;

#[cfg(feature = "probe-rs")]
mod probe;
#[cfg(feature = "probe-rs")]
pub use probe::*;

/// Error type for RTT operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No debug probe could be opened.
    #[error("No debug probe available. Make sure your probe is plugged in, supported and up-to-date.")]
    ProbeNotFound,

    /// A probe is connected, but the target behind it is not reachable or reports no RAM.
    #[error("Debug probe found, but no target with usable RAM was detected.")]
    TargetNotDetected,

    /// RTT control block not found in target memory. Make sure RTT is initialized on the target.
    #[error(
        "RTT control block not found in target memory.\n\
        - Make sure RTT is initialized on the target.\n\
        - Depending on the target, sleep modes can interfere with RTT."
    )]
    ControlBlockNotFound,

    /// The control block has been corrupted. The data contains a detailed error.
    #[error("Control block corrupted: {0}")]
    ControlBlockCorrupted(String),

    /// Wraps errors propagated up from the debug probe transport.
    #[error("Error communicating with probe: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The transport returned something other than what was asked for.
    #[error("Unexpected error while reading {0} from target memory. Please report this as a bug.")]
    MemoryRead(String),

    /// Writing received bytes to the output sink failed.
    #[error("Error writing RTT output: {0}")]
    Output(#[from] std::io::Error),

    /// The session was cancelled.
    #[error("Shutdown requested")]
    ShutdownRequested,
}

impl Error {
    /// Wraps an arbitrary transport error.
    pub fn transport(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Transport(error.into())
    }

    /// Returns `true` if the error means the probe link itself can no longer be trusted, so the
    /// control block address has to be considered stale.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::ProbeNotFound
                | Error::TargetNotDetected
                | Error::Transport(_)
                | Error::MemoryRead(_)
        )
    }
}
