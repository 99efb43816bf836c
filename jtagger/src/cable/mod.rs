//! Physical transports.
//!
//! Every cable exposes the same capability set: execute one compiled
//! template as a synchronous bus round-trip, report and adjust the TCK
//! rate, and close down cleanly. The concrete transports are tagged
//! variants rather than trait objects, so the compiler can see the whole
//! set.

pub mod loopback;
pub mod mpsse;
pub mod sim;
pub mod xvc;

use bitvec::prelude::*;

use crate::config::{Config, ConfigError};
use crate::error::Error;
use crate::template::compiler::{CompiledTemplate, PlanStyle};
use loopback::Loopback;
use mpsse::MpsseCable;
use xvc::XvcCable;

/// Transfer-level failures: the bytes did not move the way they should.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("expected to write {expected} bytes, wrote {got}")]
    ShortWrite { expected: usize, got: usize },

    #[error("expected to read {expected} bytes, read {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("remote socket closed")]
    SocketClosed,
}

/// The bytes moved, but the peer did not say what it should have.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("MPSSE synchronisation failed: expected [FA, AA], got {response:02X?}")]
    SyncFailed { response: Vec<u8> },

    #[error("MPSSE loopback self-test readback mismatch")]
    LoopbackFailed,

    #[error("malformed greeting from XVC server: {reply:?}")]
    BadGreeting { reply: String },

    #[error("shift of {bits} bits exceeds the server limit of {max}")]
    ShiftTooLong { bits: usize, max: usize },
}

/// Device selection and open failures.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no cable matches {selector:?}\n\nDevices available:\n{available}")]
    NotFound { selector: String, available: String },

    #[error("{count} cables match {selector:?}; select one by index\n\nDevices available:\n{available}")]
    Ambiguous { selector: String, count: usize, available: String },

    #[error("cannot open device: {0}")]
    CannotOpen(#[source] std::io::Error),

    #[error("chip {chip} has no MPSSE engine")]
    NotMpsseCapable { chip: String },
}

/// A physical (or simulated) JTAG cable.
#[derive(Debug)]
pub enum Cable {
    Mpsse(MpsseCable),
    Xvc(XvcCable),
    Loopback(Loopback),
}

impl Cable {
    /// Opens the transport named by `CABLE_DRIVER`.
    pub fn open(config: &Config) -> Result<Cable, Error> {
        let driver = config.cable_driver.as_deref().ok_or(ConfigError::NoCableDriver)?;
        match driver.to_ascii_lowercase().as_str() {
            "ftdi" | "mpsse" => Ok(Cable::Mpsse(MpsseCable::open(config)?)),
            "xvc" => {
                // `CABLE_NAME` may carry `host` or `host port`, the
                // original tools' convention; explicit keys win.
                let mut host = config.xvc.host.clone();
                let mut port = config.xvc.port;
                if let Some(name) = config.cable_name.as_deref() {
                    let mut words = name.split_whitespace();
                    if let Some(h) = words.next() {
                        host = h.to_string();
                    }
                    if let Some(p) = words.next() {
                        port = p.parse().map_err(|_| ConfigError::InvalidValue {
                            key: "CABLE_NAME".into(),
                            value: name.into(),
                            reason: "expected <host> [<port>]".into(),
                        })?;
                    }
                }
                Ok(Cable::Xvc(XvcCable::connect(&host, port)?))
            }
            "loopback" => Ok(Cable::Loopback(Loopback::mirror())),
            _ => Err(ConfigError::UnknownCableDriver { name: driver.to_string() }.into()),
        }
    }

    /// Which wire-program flavour this cable consumes.
    pub fn plan_style(&self) -> PlanStyle {
        match self {
            Cable::Mpsse(cable) => cable.plan_style(),
            Cable::Xvc(_) | Cable::Loopback(_) => PlanStyle::Raw,
        }
    }

    /// Executes one compiled template against the wire.
    pub fn execute(
        &mut self,
        plan: &CompiledTemplate,
        values: &[u64],
    ) -> Result<Vec<BitVec<u8, Lsb0>>, Error> {
        debug_assert_eq!(plan.style, self.plan_style());
        match self {
            Cable::Mpsse(cable) => cable.execute(plan, values),
            Cable::Xvc(cable) => cable.execute(plan, values),
            Cable::Loopback(cable) => cable.execute(plan, values),
        }
    }

    /// The negotiated TCK rate.
    pub fn speed_khz(&self) -> u32 {
        match self {
            Cable::Mpsse(cable) => cable.speed_khz(),
            Cable::Xvc(cable) => cable.speed_khz(),
            Cable::Loopback(cable) => cable.speed_khz(),
        }
    }

    /// Requests a TCK rate; returns what the hardware actually applied.
    pub fn set_speed_khz(&mut self, speed_khz: u32) -> Result<u32, Error> {
        match self {
            Cable::Mpsse(cable) => cable.set_speed_khz(speed_khz),
            Cable::Xvc(cable) => cable.set_speed_khz(speed_khz),
            Cable::Loopback(cable) => Ok(cable.set_speed_khz(speed_khz)),
        }
    }

    /// Releases the transport. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        match self {
            Cable::Mpsse(cable) => cable.close(),
            Cable::Xvc(cable) => cable.close(),
            Cable::Loopback(_) => {}
        }
    }
}

/// Asks the network stack to send acks immediately. Linux only; elsewhere
/// `TCP_NODELAY` is as close as we get.
#[cfg(target_os = "linux")]
pub(crate) fn set_quickack(stream: &std::net::TcpStream) -> Result<(), IoError> {
    use std::os::fd::AsRawFd;
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(IoError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_quickack(_stream: &std::net::TcpStream) -> Result<(), IoError> {
    Ok(())
}
