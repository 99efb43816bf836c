//! Raw USB access to FTDI chips.
//!
//! Talks to the chip with vendor control requests (the SIO command set) and
//! bulk transfers through `nusb`. Incoming bulk packets carry two modem
//! status bytes that must be stripped per packet; surplus payload is queued
//! for the next read.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use async_io::{block_on, Timer};
use futures_lite::FutureExt;
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};
use nusb::DeviceInfo;

use crate::cable::{DeviceError, IoError};

const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_SET_EVENT_CHAR_REQUEST: u8 = 0x06;
const SIO_SET_ERROR_CHAR_REQUEST: u8 = 0x07;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

/// Stand-in for "block forever" when a zero timeout is configured.
const BLOCKING: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChipType {
    Am,
    Bm,
    FT2232C,
    R,
    FT2232H,
    FT4232H,
    FT232H,
    FT230X,
}

/// MPSSE capabilities of a chip type.
#[derive(Debug, Clone, Copy)]
pub struct MpsseProperties {
    /// The chip-side command buffer; one batch must fit.
    pub buffer_size: usize,
    /// Highest TCK in Hz with the clock tree fully opened up.
    pub base_clock_hz: f64,
    /// Whether the 60 MHz core is gated behind the divide-by-5.
    pub high_speed: bool,
}

impl ChipType {
    pub fn mpsse_properties(self) -> Option<MpsseProperties> {
        match self {
            ChipType::FT2232H | ChipType::FT4232H => Some(MpsseProperties {
                buffer_size: 4096,
                base_clock_hz: 30e6,
                high_speed: true,
            }),
            ChipType::FT232H => Some(MpsseProperties {
                buffer_size: 1024,
                base_clock_hz: 30e6,
                high_speed: true,
            }),
            ChipType::FT2232C => Some(MpsseProperties {
                buffer_size: 128,
                base_clock_hz: 6e6,
                high_speed: false,
            }),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BitMode {
    Reset = 0,
    Mpsse = 2,
}

/// An open FTDI channel (interface A), bulk endpoints claimed.
pub struct FtdiDevice {
    interface: nusb::Interface,
    /// SIO requests address channels 1-based.
    index: u16,
    read_ep: u8,
    write_ep: u8,
    max_packet_size: usize,
    chip_type: Option<ChipType>,
    description: String,
    read_timeout: Duration,
    write_timeout: Duration,
    read_queue: VecDeque<u8>,
    read_buffer: Vec<u8>,
}

impl std::fmt::Debug for FtdiDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtdiDevice")
            .field("chip_type", &self.chip_type)
            .field("description", &self.description)
            .finish()
    }
}

/// Display string for device listings: product and serial, squeezed.
pub(crate) fn describe(info: &DeviceInfo) -> String {
    let product = info.product_string().unwrap_or("FTDI");
    match info.serial_number() {
        Some(serial) if !serial.is_empty() => format!("{product} {serial}"),
        _ => product.to_string(),
    }
}

impl FtdiDevice {
    pub fn open(
        info: &DeviceInfo,
        read_timeout_ms: u32,
        write_timeout_ms: u32,
    ) -> Result<FtdiDevice, DeviceError> {
        let device = info.open().map_err(DeviceError::CannotOpen)?;

        let chip_type = match (info.device_version(), info.serial_number().unwrap_or("")) {
            (0x400, _) | (0x200, "") => Some(ChipType::Bm),
            (0x200, _) => Some(ChipType::Am),
            (0x500, _) => Some(ChipType::FT2232C),
            (0x600, _) => Some(ChipType::R),
            (0x700, _) => Some(ChipType::FT2232H),
            (0x800, _) => Some(ChipType::FT4232H),
            (0x900, _) => Some(ChipType::FT232H),
            (0x1000, _) => Some(ChipType::FT230X),
            (version, _) => {
                tracing::warn!("Unknown FTDI device version: {version:#X}");
                None
            }
        };

        // Channel A carries the MPSSE on every multi-channel part.
        let (read_ep, write_ep) = (0x81, 0x02);
        let mut claimed = 0u8;
        let mut max_packet_size = 64;
        'scan: for config in device.configurations() {
            for intf in config.interfaces() {
                for desc in intf.alt_settings() {
                    for ep in desc.endpoints() {
                        if ep.address() == write_ep {
                            claimed = desc.interface_number();
                            max_packet_size = ep.max_packet_size();
                            break 'scan;
                        }
                    }
                }
            }
        }
        let interface = device.claim_interface(claimed).map_err(DeviceError::CannotOpen)?;

        tracing::debug!("Opened FTDI device: {chip_type:?}");
        Ok(FtdiDevice {
            interface,
            index: 1,
            read_ep,
            write_ep,
            max_packet_size,
            chip_type,
            description: describe(info),
            read_timeout: timeout_from_ms(read_timeout_ms),
            write_timeout: timeout_from_ms(write_timeout_ms),
            read_queue: VecDeque::new(),
            read_buffer: vec![0; max_packet_size.max(64)],
        })
    }

    pub fn chip_type(&self) -> Option<ChipType> {
        self.chip_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn sio_write(&mut self, request: u8, value: u16) -> Result<(), IoError> {
        self.interface
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: self.index,
                },
                &[],
                self.write_timeout,
            )
            .map_err(|e| IoError::Io(io::Error::other(e)))?;
        Ok(())
    }

    pub fn usb_reset(&mut self) -> Result<(), IoError> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)
    }

    pub fn purge_buffers(&mut self) -> Result<(), IoError> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.read_queue.clear();
        Ok(())
    }

    /// Disables the event and error characters.
    pub fn set_chars_off(&mut self) -> Result<(), IoError> {
        self.sio_write(SIO_SET_EVENT_CHAR_REQUEST, 0)?;
        self.sio_write(SIO_SET_ERROR_CHAR_REQUEST, 0)
    }

    pub fn set_latency_timer(&mut self, ms: u8) -> Result<(), IoError> {
        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, ms as u16)
    }

    pub fn set_bitmode(&mut self, bitmask: u8, mode: BitMode) -> Result<(), IoError> {
        self.sio_write(SIO_SET_BITMODE_REQUEST, u16::from_le_bytes([bitmask, mode as u8]))
    }

    /// Writes the whole buffer, chunked to the endpoint packet size.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        for chunk in data.chunks(self.max_packet_size) {
            let done = block_on(
                async {
                    let comp = self.interface.bulk_out(self.write_ep, chunk.to_vec()).await;
                    comp.status.map_err(|e| IoError::Io(io::Error::other(e)))?;
                    Ok(comp.data.actual_length())
                }
                .or(async {
                    Timer::after(self.write_timeout).await;
                    Err(IoError::Timeout)
                }),
            )?;
            if done != chunk.len() {
                return Err(IoError::ShortWrite { expected: chunk.len(), got: done });
            }
        }
        tracing::trace!("wrote {} bytes", data.len());
        Ok(())
    }

    /// One bulk-in transfer with the status bytes stripped; returns payload
    /// length appended to `self.read_queue`.
    fn fill_queue(&mut self) -> Result<usize, IoError> {
        let len = self.read_buffer.len();
        let data = block_on(
            async {
                let comp = self.interface.bulk_in(self.read_ep, RequestBuffer::new(len)).await;
                comp.status.map_err(|e| IoError::Io(io::Error::other(e)))?;
                Ok(comp.data)
            }
            .or(async {
                Timer::after(self.read_timeout).await;
                Err(IoError::Timeout)
            }),
        )?;
        let mut payload = 0;
        for packet in data.chunks(self.max_packet_size) {
            // Every USB packet leads with two modem status bytes.
            if packet.len() > 2 {
                self.read_queue.extend(&packet[2..]);
                payload += packet.len() - 2;
            }
        }
        Ok(payload)
    }

    /// Reads exactly `buf.len()` payload bytes.
    ///
    /// The timeout restarts whenever the chip makes progress, matching the
    /// latency-timer-driven trickle of short packets.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        let mut filled = 0;
        let mut t0 = Instant::now();
        while filled < buf.len() {
            while let Some(byte) = self.read_queue.pop_front() {
                buf[filled] = byte;
                filled += 1;
                if filled == buf.len() {
                    tracing::trace!("read {} bytes", buf.len());
                    return Ok(());
                }
            }
            match self.fill_queue() {
                Ok(0) => {
                    if t0.elapsed() > self.read_timeout {
                        tracing::warn!("read {filled} bytes, expected {}", buf.len());
                        return Err(IoError::Timeout);
                    }
                }
                Ok(_) => t0 = Instant::now(),
                Err(e) => {
                    tracing::warn!("read {filled} bytes, expected {}: {e}", buf.len());
                    return Err(e);
                }
            }
        }
        tracing::trace!("read {} bytes", buf.len());
        Ok(())
    }

    /// Discards whatever the chip has buffered.
    pub fn drain(&mut self) {
        self.read_queue.clear();
        let saved = self.read_timeout;
        self.read_timeout = Duration::from_millis(20);
        while matches!(self.fill_queue(), Ok(n) if n > 0) {}
        self.read_timeout = saved;
    }
}

fn timeout_from_ms(ms: u32) -> Duration {
    if ms == 0 {
        BLOCKING
    } else {
        Duration::from_millis(ms as u64)
    }
}

/// VID/PID pairs this driver recognises: stock FTDI ids plus the Olimex
/// ARM-USB family. Digilent cables reuse the stock FTDI ids.
pub(crate) const FTDI_COMPAT_IDS: &[(u16, u16)] = &[
    (0x0403, 0x6010),
    (0x0403, 0x6011),
    (0x0403, 0x6014),
    (0x15ba, 0x0003),
    (0x15ba, 0x0004),
    (0x15ba, 0x002a),
    (0x15ba, 0x002b),
];

/// Enumerates attached FTDI-compatible devices.
pub(crate) fn list_devices() -> Result<Vec<DeviceInfo>, IoError> {
    let devices = nusb::list_devices().map_err(IoError::Io)?;
    Ok(devices
        .filter(|d| FTDI_COMPAT_IDS.contains(&(d.vendor_id(), d.product_id())))
        .collect())
}
