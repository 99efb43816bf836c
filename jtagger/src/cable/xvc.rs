//! Xilinx Virtual Cable client transport.
//!
//! Tunnels raw TMS/TDI/TDO bit streams over TCP, little-endian, LSB-first
//! within each byte. One `shift:` frame is one synchronous round-trip.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bitvec::prelude::*;

use super::{set_quickack, IoError, ProtocolError};
use crate::error::Error;
use crate::template::compiler::CompiledTemplate;

/// Advertised ceiling when the server's `getinfo:` reply is unusable.
const DEFAULT_MAX_BITS: usize = 120_000;

#[derive(Debug)]
pub struct XvcCable {
    stream: TcpStream,
    /// Largest shift the server accepts, learned from `getinfo:`.
    max_bits: usize,
    tck_period_ns: u32,
    cmd: Vec<u8>,
    response: Vec<u8>,
    scratch: BitVec<u8, Lsb0>,
    closed: bool,
}

impl XvcCable {
    /// Connects and interrogates the server.
    pub fn connect(host: &str, port: u16) -> Result<XvcCable, Error> {
        tracing::info!("Connecting to XVC server at {host}:{port}...");
        let stream = TcpStream::connect((host, port)).map_err(IoError::Io)?;
        stream.set_nodelay(true).map_err(IoError::Io)?;
        set_quickack(&stream)?;
        stream.set_read_timeout(Some(Duration::from_secs(10))).map_err(IoError::Io)?;

        let mut cable = XvcCable {
            stream,
            max_bits: DEFAULT_MAX_BITS,
            tck_period_ns: 1000,
            cmd: Vec::new(),
            response: Vec::new(),
            scratch: BitVec::new(),
            closed: false,
        };
        cable.max_bits = cable.getinfo()?;
        tracing::debug!("XVC server accepts shifts of up to {} bits", cable.max_bits);
        Ok(cable)
    }

    /// `getinfo:` handshake; the reply names the protocol version and the
    /// server's per-shift capacity.
    fn getinfo(&mut self) -> Result<usize, Error> {
        self.stream.write_all(b"getinfo:").map_err(io_error)?;
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(IoError::SocketClosed.into()),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    reply.push(byte[0]);
                    if reply.len() > 64 {
                        break;
                    }
                }
                Err(e) => return Err(io_error(e).into()),
            }
        }
        let reply = String::from_utf8_lossy(&reply).into_owned();
        let max_bits = reply
            .strip_prefix("xvcServer_v1.0:")
            .and_then(|n| n.trim().parse::<usize>().ok())
            .ok_or(ProtocolError::BadGreeting { reply })?;
        Ok(max_bits)
    }

    /// `settck:` sets the TCK period in nanoseconds; the server echoes the
    /// period it actually applied.
    pub fn settck(&mut self, period_ns: u32) -> Result<u32, Error> {
        self.cmd.clear();
        self.cmd.extend_from_slice(b"settck:");
        self.cmd.extend_from_slice(&period_ns.to_le_bytes());
        self.stream.write_all(&self.cmd).map_err(io_error)?;
        let mut echo = [0u8; 4];
        self.stream.read_exact(&mut echo).map_err(io_error)?;
        self.tck_period_ns = u32::from_le_bytes(echo);
        Ok(self.tck_period_ns)
    }

    pub(crate) fn speed_khz(&self) -> u32 {
        1_000_000 / self.tck_period_ns.max(1)
    }

    pub(crate) fn set_speed_khz(&mut self, speed_khz: u32) -> Result<u32, Error> {
        let period_ns = 1_000_000 / speed_khz.max(1);
        self.settck(period_ns)?;
        Ok(self.speed_khz())
    }

    pub(crate) fn execute(
        &mut self,
        plan: &CompiledTemplate,
        values: &[u64],
    ) -> Result<Vec<BitVec<u8, Lsb0>>, Error> {
        let clocks = plan.clocks();
        if clocks == 0 {
            return Ok(plan.extract(BitSlice::empty()));
        }
        if clocks > self.max_bits {
            return Err(ProtocolError::ShiftTooLong { bits: clocks, max: self.max_bits }.into());
        }
        plan.combine(values, &mut self.scratch)?;
        let frame_bytes = clocks.div_ceil(8);

        self.cmd.clear();
        self.cmd.extend_from_slice(b"shift:");
        self.cmd.extend_from_slice(&(clocks as u32).to_le_bytes());
        self.cmd.extend_from_slice(&plan.tms_frame);
        self.cmd.extend_from_slice(&self.scratch.as_raw_slice()[..frame_bytes]);
        self.stream.write_all(&self.cmd).map_err(io_error)?;

        self.response.clear();
        self.response.resize(frame_bytes, 0);
        self.stream.read_exact(&mut self.response).map_err(io_error)?;

        Ok(plan.extract(self.response.view_bits::<Lsb0>()))
    }

    /// Idempotent shutdown of the underlying socket.
    pub(crate) fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for XvcCable {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_error(e: std::io::Error) -> IoError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
            IoError::SocketClosed
        }
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => IoError::Timeout,
        _ => IoError::Io(e),
    }
}
