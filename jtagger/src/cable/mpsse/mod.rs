//! FTDI MPSSE transport adapter.
//!
//! Owns the USB device and the send/receive buffers, runs the documented
//! init sequence at attach time, and executes compiled command programs in
//! batches sized to the chip's buffer.

pub(crate) mod commands;
pub mod ftdi;

use std::time::Duration;

use bitvec::prelude::*;

use self::commands::*;
use self::ftdi::{BitMode, FtdiDevice, MpsseProperties};
use super::{DeviceError, IoError, ProtocolError};
use crate::config::{Config, FtdiConfig};
use crate::error::Error;
use crate::template::compiler::{CompiledTemplate, PlanStyle};

#[derive(Debug)]
pub struct MpsseCable {
    device: FtdiDevice,
    props: MpsseProperties,
    cfg: FtdiConfig,
    speed_khz: u32,
    gpio_mask: u16,
    gpio_out: u16,
    /// Outgoing command scratch; reused across transactions.
    out_scratch: BitVec<u8, Lsb0>,
    /// Response buffer; reused across transactions.
    in_buffer: Vec<u8>,
    closed: bool,
}

impl MpsseCable {
    /// Opens the cable selected by `CABLE_NAME` and runs the init sequence.
    pub fn open(config: &Config) -> Result<MpsseCable, Error> {
        let devices = ftdi::list_devices()?;
        let selected = select_device(&devices, config.cable_name.as_deref())?;

        let cfg = config.ftdi.clone();
        let device =
            FtdiDevice::open(&devices[selected], cfg.read_timeout_ms, cfg.write_timeout_ms)?;
        let props = device
            .chip_type()
            .and_then(|ty| ty.mpsse_properties())
            .ok_or_else(|| DeviceError::NotMpsseCapable {
                chip: format!("{:?}", device.chip_type()),
            })?;

        let mut cable = MpsseCable {
            device,
            props,
            speed_khz: 0,
            gpio_mask: 0,
            gpio_out: 0,
            out_scratch: BitVec::with_capacity(cfg.usb_out_size * 8),
            in_buffer: Vec::with_capacity(cfg.usb_in_size),
            cfg,
            closed: false,
        };
        cable.attach(config)?;
        Ok(cable)
    }

    /// The init sequence from AN129: purge, configure transfer parameters,
    /// enter MPSSE mode, synchronise, set the clock, drive the GPIOs.
    fn attach(&mut self, config: &Config) -> Result<(), Error> {
        self.device.usb_reset()?;
        // Purging is best effort; some Linux driver stacks reject it.
        if let Err(e) = self.device.purge_buffers() {
            tracing::debug!("purge failed, continuing: {e}");
        }
        self.device.set_chars_off()?;
        self.device.set_latency_timer(self.cfg.latency_timer)?;
        self.device.set_bitmode(0, BitMode::Reset)?;
        self.device.set_bitmode(0x0b, BitMode::Mpsse)?;
        std::thread::sleep(Duration::from_millis(self.cfg.startup_sleep_ms as u64));

        self.synchronize()?;
        self.apply_speed(self.cfg.jtag_freq_hz)?;
        if self.cfg.loopback_test {
            self.loopback_test()?;
        }
        self.gpio_mask = self.cfg.gpio_mask;
        self.write_gpio(self.cfg.gpio_out)?;
        if config.log_packets {
            tracing::debug!("GPIO readback: {:#06x}", self.read_gpio()?);
        }
        self.synchronize()?;
        Ok(())
    }

    /// Writes the deliberately invalid opcode and checks the echo, proving
    /// the command stream and our read position are aligned.
    fn synchronize(&mut self) -> Result<(), Error> {
        self.device.drain();
        self.device.write_all(&[BOGUS_COMMAND, SEND_IMMEDIATE])?;
        let mut echo = [0u8; 2];
        self.device.read_exact(&mut echo)?;
        if echo != [BAD_COMMAND_ECHO, BOGUS_COMMAND] {
            return Err(ProtocolError::SyncFailed { response: echo.to_vec() }.into());
        }
        Ok(())
    }

    /// Programs the clock divisor for the requested frequency.
    fn apply_speed(&mut self, freq_hz: f64) -> Result<u32, Error> {
        let base = if self.props.high_speed {
            self.device.write_all(&[
                DISABLE_CLK_DIVIDE_BY_5,
                DISABLE_THREE_PHASE,
                if self.cfg.adaptive_clocking {
                    ENABLE_ADAPTIVE_CLOCKING
                } else {
                    DISABLE_ADAPTIVE_CLOCKING
                },
                LOOPBACK_DISABLE,
            ])?;
            self.props.base_clock_hz
        } else {
            // Older cores only know the divided clock; say so explicitly.
            self.device.write_all(&[ENABLE_CLK_DIVIDE_BY_5, LOOPBACK_DISABLE])?;
            self.props.base_clock_hz
        };
        let divisor = ((base / freq_hz - 1.0).max(0.0) as u32).min(0xFFFF);
        self.device.write_all(&[SET_DIVISOR, divisor as u8, (divisor >> 8) as u8])?;
        let actual = base / f64::from(divisor + 1);
        self.speed_khz = (actual / 1000.0) as u32;
        tracing::info!(
            "TCK set to {:.0} Hz (requested {:.0} Hz, divisor {divisor})",
            actual,
            freq_hz
        );
        Ok(self.speed_khz)
    }

    /// Shifts a known pattern with loopback enabled and verifies the echo.
    fn loopback_test(&mut self) -> Result<(), Error> {
        const PATTERN: [u8; 4] = [0xA5, 0x5A, 0xF0, 0x0F];
        self.device.write_all(&[LOOPBACK_ENABLE])?;
        // Clock-data-bytes, out on -ve edge, in on +ve edge, LSB first.
        self.device.write_all(&[0x39, PATTERN.len() as u8 - 1, 0x00])?;
        self.device.write_all(&PATTERN)?;
        self.device.write_all(&[SEND_IMMEDIATE])?;
        let mut echo = [0u8; PATTERN.len()];
        self.device.read_exact(&mut echo)?;
        self.device.write_all(&[LOOPBACK_DISABLE])?;
        if echo != PATTERN {
            return Err(ProtocolError::LoopbackFailed.into());
        }
        tracing::debug!("loopback self-test passed");
        Ok(())
    }

    /// Drives the GPIO pins through the configured direction mask.
    pub fn write_gpio(&mut self, value: u16) -> Result<(), Error> {
        self.gpio_out = value;
        self.device.write_all(&[
            SET_BITS_LOW,
            value as u8,
            self.gpio_mask as u8,
            SET_BITS_HIGH,
            (value >> 8) as u8,
            (self.gpio_mask >> 8) as u8,
        ])?;
        Ok(())
    }

    pub fn read_gpio(&mut self) -> Result<u16, Error> {
        self.device.write_all(&[GET_BITS_LOW, GET_BITS_HIGH, SEND_IMMEDIATE])?;
        let mut pins = [0u8; 2];
        self.device.read_exact(&mut pins)?;
        Ok(u16::from_le_bytes(pins))
    }

    pub(crate) fn plan_style(&self) -> PlanStyle {
        PlanStyle::Mpsse { buffer_size: self.props.buffer_size.min(self.cfg.usb_out_size) }
    }

    pub(crate) fn speed_khz(&self) -> u32 {
        self.speed_khz
    }

    pub(crate) fn set_speed_khz(&mut self, speed_khz: u32) -> Result<u32, Error> {
        self.apply_speed(f64::from(speed_khz) * 1000.0)
    }

    /// One compiled transaction: write each batch, collect its response.
    pub(crate) fn execute(
        &mut self,
        plan: &CompiledTemplate,
        values: &[u64],
    ) -> Result<Vec<BitVec<u8, Lsb0>>, Error> {
        plan.combine(values, &mut self.out_scratch)?;
        self.in_buffer.clear();
        self.in_buffer.resize(plan.read_bytes, 0);

        let MpsseCable { device, out_scratch, in_buffer, .. } = self;
        let bytes = out_scratch.as_raw_slice();
        let mut out_cursor = 0;
        let mut read_cursor = 0;
        for batch in &plan.batches {
            device.write_all(&bytes[out_cursor..batch.out_end])?;
            out_cursor = batch.out_end;
            if batch.read_end > read_cursor {
                device.write_all(&[SEND_IMMEDIATE])?;
                device.read_exact(&mut in_buffer[read_cursor..batch.read_end])?;
                read_cursor = batch.read_end;
            }
        }
        debug_assert_eq!(read_cursor, plan.read_bytes);

        Ok(plan.extract(in_buffer.view_bits::<Lsb0>()))
    }

    /// Parks the pins, resynchronises, and releases the device. Runs on
    /// every exit path and is idempotent.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.gpio_mask = 0;
        let _ = self.write_gpio(0xFFFF);
        if let Err(e) = self.synchronize() {
            tracing::warn!("resync during close failed: {e}");
        }
    }
}

impl Drop for MpsseCable {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolves `CABLE_NAME` to a device index: a number selects by position,
/// anything else matches case-insensitively against the USB strings.
fn select_device(
    devices: &[nusb::DeviceInfo],
    name: Option<&str>,
) -> Result<usize, DeviceError> {
    let list = || {
        devices
            .iter()
            .enumerate()
            .map(|(i, d)| format!("  [{i}] {}", ftdi::describe(d)))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let selector = name.unwrap_or("<first>").to_string();

    match name {
        None => {
            if devices.len() == 1 {
                Ok(0)
            } else if devices.is_empty() {
                Err(DeviceError::NotFound { selector, available: list() })
            } else {
                Err(DeviceError::Ambiguous { selector, count: devices.len(), available: list() })
            }
        }
        Some(name) => {
            if let Ok(index) = name.parse::<usize>() {
                return if index < devices.len() {
                    Ok(index)
                } else {
                    Err(DeviceError::NotFound { selector, available: list() })
                };
            }
            let needle: String = name.split_whitespace().collect::<String>().to_lowercase();
            let matches: Vec<usize> = devices
                .iter()
                .enumerate()
                .filter(|(_, d)| {
                    let hay: String =
                        ftdi::describe(d).split_whitespace().collect::<String>().to_lowercase();
                    hay.contains(&needle)
                })
                .map(|(i, _)| i)
                .collect();
            match matches.as_slice() {
                [index] => Ok(*index),
                [] => Err(DeviceError::NotFound { selector, available: list() }),
                _ => Err(DeviceError::Ambiguous {
                    selector,
                    count: matches.len(),
                    available: list(),
                }),
            }
        }
    }
}
