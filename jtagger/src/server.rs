//! The XVC server.
//!
//! Serves the Xilinx Virtual Cable protocol over TCP, tunnelling `shift:`
//! frames onto whatever cable this process owns. One client at a time: the
//! listening socket is dropped while a client is being served, so a second
//! connection attempt is refused outright instead of hanging.
//!
//! The peer (a vendor tool) already knows JTAG; we do not interpret its bit
//! streams. Each distinct `numbits`+TMS prefix is compiled into a reusable
//! passthrough template, keyed in a command cache, so repeated shifts of
//! the same shape only pay for compilation once.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use bitvec::prelude::*;

use crate::cable::{set_quickack, Cable, IoError, ProtocolError};
use crate::error::Error;
use crate::template::{JtagTemplate, MAX_VALUE_BITS};

/// Per-shift capacity we advertise in `getinfo:`.
pub const MAX_VECTOR_BITS: usize = 120_000;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub port: u16,
    /// Dump each command's TMS/TDI/TDO bytes through tracing.
    pub log_packets: bool,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions { port: 2542, log_packets: false }
    }
}

/// Accepts one client after another, forever. Each client gets a fresh
/// listener once the previous one disconnects.
pub fn run(cable: &mut Cable, options: &ServerOptions) -> Result<(), Error> {
    loop {
        let listener =
            TcpListener::bind(("0.0.0.0", options.port)).map_err(IoError::Io)?;
        tracing::info!(
            "Waiting for xvc connection on {} (Ctrl-C to exit)",
            listener.local_addr().map_err(IoError::Io)?
        );
        // A misbehaving client only costs its own session.
        if let Err(e) = serve_one(listener, cable, options) {
            tracing::warn!("client session ended with error: {e}");
        }
        // Give the stack a moment before rebinding the same port.
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Accepts a single client on `listener`, closes the listener, and serves
/// commands strictly in order until the client disconnects.
///
/// Exposed separately so tests can bind an ephemeral port themselves.
pub fn serve_one(
    listener: TcpListener,
    cable: &mut Cable,
    options: &ServerOptions,
) -> Result<(), Error> {
    let (stream, peer) = listener.accept().map_err(IoError::Io)?;
    // Refuse further clients immediately.
    drop(listener);
    tracing::info!("Connected to {peer} -- now serving xvc");
    stream.set_nodelay(true).map_err(IoError::Io)?;
    set_quickack(&stream)?;

    let result = serve_client(stream, cable, options);
    if result.is_ok() {
        tracing::info!("Client disconnected.");
    }
    result
}

fn serve_client(
    mut stream: TcpStream,
    cable: &mut Cable,
    options: &ServerOptions,
) -> Result<(), Error> {
    let mut cache: HashMap<(u32, Vec<u8>), JtagTemplate> = HashMap::new();
    let mut tdi_values = Vec::new();
    let mut reply = Vec::new();

    loop {
        let command = match read_command_name(&mut stream)? {
            Some(name) => name,
            None => return Ok(()),
        };
        match command.as_str() {
            "getinfo" => {
                let info = format!("xvcServer_v1.0:{MAX_VECTOR_BITS}\n");
                stream.write_all(info.as_bytes()).map_err(IoError::Io)?;
            }
            "settck" => {
                let mut period = [0u8; 4];
                stream.read_exact(&mut period).map_err(io_closed)?;
                let period_ns = u32::from_le_bytes(period);
                tracing::debug!("settck: {period_ns} ns");
                let _ = cable.set_speed_khz(1_000_000 / period_ns.max(1));
                stream.write_all(&period).map_err(IoError::Io)?;
            }
            "shift" => {
                let mut header = [0u8; 4];
                stream.read_exact(&mut header).map_err(io_closed)?;
                let numbits = u32::from_le_bytes(header);
                let numbytes = (numbits as usize).div_ceil(8);
                if numbits as usize > MAX_VECTOR_BITS {
                    return Err(ProtocolError::ShiftTooLong {
                        bits: numbits as usize,
                        max: MAX_VECTOR_BITS,
                    }
                    .into());
                }
                let mut tms = vec![0u8; numbytes];
                let mut tdi = vec![0u8; numbytes];
                stream.read_exact(&mut tms).map_err(io_closed)?;
                stream.read_exact(&mut tdi).map_err(io_closed)?;

                // One template per distinct (length, TMS path) shape.
                let template = cache
                    .entry((numbits, tms.clone()))
                    .or_insert_with(|| {
                        JtagTemplate::passthrough(&tms.view_bits::<Lsb0>()[..numbits as usize])
                    });

                tdi_values.clear();
                for lane in tdi.view_bits::<Lsb0>()[..numbits as usize].chunks(MAX_VALUE_BITS) {
                    tdi_values.push(lane.load_le::<u64>());
                }

                let captured = template.run(cable, &tdi_values)?;
                reply.clear();
                reply.resize(numbytes, 0);
                let reply_bits = &mut reply.view_bits_mut::<Lsb0>()[..numbits as usize];
                let mut cursor = 0;
                for lane in &captured {
                    reply_bits[cursor..cursor + lane.len()].copy_from_bitslice(lane);
                    cursor += lane.len();
                }
                if options.log_packets {
                    tracing::debug!("NUM: {numbits}");
                    tracing::debug!("TMS: {:02x?}", tms);
                    tracing::debug!("TDI: {:02x?}", tdi);
                    tracing::debug!("TDO: {:02x?}", reply);
                }
                stream.write_all(&reply).map_err(IoError::Io)?;
            }
            other => {
                tracing::warn!("unknown xvc command {other:?}; dropping client");
                return Ok(());
            }
        }
    }
}

/// Reads a command name up to its `:` delimiter. `None` on a clean EOF
/// between commands.
fn read_command_name(stream: &mut TcpStream) -> Result<Option<String>, Error> {
    let mut name = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                return if name.is_empty() {
                    Ok(None)
                } else {
                    Err(IoError::SocketClosed.into())
                };
            }
            Ok(_) => {
                if byte[0] == b':' {
                    return Ok(Some(String::from_utf8_lossy(&name).into_owned()));
                }
                name.push(byte[0]);
                if name.len() > 16 {
                    return Ok(Some(String::from_utf8_lossy(&name).into_owned()));
                }
            }
            Err(e) => return Err(io_closed(e).into()),
        }
    }
}

fn io_closed(e: std::io::Error) -> IoError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => IoError::SocketClosed,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => IoError::Timeout,
        _ => IoError::Io(e),
    }
}
