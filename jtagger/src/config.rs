//! Typed configuration.
//!
//! Options arrive as `KEY=value` pairs from the command line or a
//! configuration file; unknown keys are errors. Each transport contributes a
//! static default record (`FtdiConfig`, `XvcConfig`) that the user's
//! explicit assignments overwrite.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration key {key:?}")]
    UnknownKey { key: String },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue { key: String, value: String, reason: String },

    #[error("unknown cable driver {name:?} (expected ftdi, xvc or loopback)")]
    UnknownCableDriver { name: String },

    #[error("no cable driver selected")]
    NoCableDriver,
}

/// FTDI/MPSSE transport defaults, matching the vendor application notes.
#[derive(Debug, Clone, PartialEq)]
pub struct FtdiConfig {
    /// Host-side USB receive buffer, bytes.
    pub usb_in_size: usize,
    /// Host-side USB transmit buffer, bytes.
    pub usb_out_size: usize,
    /// Read timeout in milliseconds; 0 blocks indefinitely.
    pub read_timeout_ms: u32,
    pub write_timeout_ms: u32,
    pub latency_timer: u8,
    /// Pause between entering MPSSE mode and the first command.
    pub startup_sleep_ms: u32,
    /// Requested TCK frequency in Hz.
    pub jtag_freq_hz: f64,
    /// GPIO direction mask; bits set are driven outputs.
    pub gpio_mask: u16,
    /// Initial GPIO output levels.
    pub gpio_out: u16,
    pub adaptive_clocking: bool,
    /// Run the loopback self-test during attach.
    pub loopback_test: bool,
}

impl Default for FtdiConfig {
    fn default() -> FtdiConfig {
        FtdiConfig {
            usb_in_size: 65535,
            usb_out_size: 65535,
            read_timeout_ms: 0,
            write_timeout_ms: 5000,
            latency_timer: 16,
            startup_sleep_ms: 50,
            jtag_freq_hz: 15e6,
            gpio_mask: 0x1b,
            gpio_out: 0x08,
            adaptive_clocking: false,
            loopback_test: false,
        }
    }
}

/// XVC client transport defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct XvcConfig {
    pub host: String,
    pub port: u16,
}

impl Default for XvcConfig {
    fn default() -> XvcConfig {
        XvcConfig { host: "localhost".into(), port: 2542 }
    }
}

/// The full configuration record. Field defaults are the static per-option
/// defaults; [`Config::apply`] overwrites them from `KEY=value` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Transport selection: `ftdi`, `xvc` or `loopback`.
    pub cable_driver: Option<String>,
    /// Device index or human-readable name within the selected transport.
    pub cable_name: Option<String>,
    /// TCP port the XVC server listens on.
    pub socket_address: u16,
    pub show_chain: bool,
    pub show_config: bool,
    /// Dump wire packets through the tracing sink.
    pub log_packets: bool,
    /// Overrides the built-in parts database file.
    pub jtagid_file: Option<PathBuf>,
    pub ftdi: FtdiConfig,
    pub xvc: XvcConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            cable_driver: None,
            cable_name: None,
            socket_address: 2542,
            show_chain: true,
            show_config: false,
            log_packets: false,
            jtagid_file: None,
            ftdi: FtdiConfig::default(),
            xvc: XvcConfig::default(),
        }
    }
}

/// Accepts `0x`/`0b`/`0o` prefixes the way the original tools did.
fn parse_int(value: &str) -> Option<u64> {
    let v = value.trim();
    let (digits, radix) = match v.get(..2) {
        Some("0x") | Some("0X") => (&v[2..], 16),
        Some("0b") | Some("0B") => (&v[2..], 2),
        Some("0o") | Some("0O") => (&v[2..], 8),
        _ => (v, 10),
    };
    u64::from_str_radix(digits, radix).ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Builds a config from an argument list, consuming every `KEY=value`
    /// pair and returning the remaining positional arguments.
    pub fn from_args<I, S>(args: I) -> Result<(Config, Vec<String>), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Config::default();
        let mut positional = Vec::new();
        for arg in args {
            let arg = arg.into();
            match arg.split_once('=') {
                Some((key, value)) => config.apply(key, value)?,
                None => positional.push(arg),
            }
        }
        Ok((config, positional))
    }

    /// Reads `KEY=value` assignments from a configuration file, one per
    /// line, `#` comments allowed.
    pub fn apply_file(&mut self, path: &std::path::Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            key: "CONFIG_FILE".into(),
            value: path.display().to_string(),
            reason: e.to_string(),
        })?;
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: "CONFIG_FILE".into(),
                value: line.to_string(),
                reason: "expected KEY=value".into(),
            })?;
            self.apply(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Applies one `KEY=value` assignment. Keys are case-insensitive.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let upper = key.to_ascii_uppercase();
        let bad_value = |reason: &str| ConfigError::InvalidValue {
            key: upper.clone(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let int = |v: &str| parse_int(v).ok_or_else(|| bad_value("expected an integer"));
        let boolean = |v: &str| parse_bool(v).ok_or_else(|| bad_value("expected a boolean"));
        match upper.as_str() {
            "CABLE_DRIVER" => self.cable_driver = Some(value.to_string()),
            "CABLE_NAME" => self.cable_name = Some(value.to_string()),
            "SOCKET_ADDRESS" => {
                self.socket_address =
                    int(value)?.try_into().map_err(|_| bad_value("port out of range"))?
            }
            "SHOW_CHAIN" => self.show_chain = boolean(value)?,
            "SHOW_CONFIG" => self.show_config = boolean(value)?,
            "LOG_PACKETS" => self.log_packets = boolean(value)?,
            "JTAGID_FILE" => self.jtagid_file = Some(PathBuf::from(value)),
            "FTDI_USB_IN_SIZE" => self.ftdi.usb_in_size = int(value)? as usize,
            "FTDI_USB_OUT_SIZE" => self.ftdi.usb_out_size = int(value)? as usize,
            "FTDI_READ_TIMEOUT" => self.ftdi.read_timeout_ms = int(value)? as u32,
            "FTDI_WRITE_TIMEOUT" => self.ftdi.write_timeout_ms = int(value)? as u32,
            "FTDI_LATENCY_TIMER" => {
                self.ftdi.latency_timer =
                    int(value)?.try_into().map_err(|_| bad_value("expected 0..=255"))?
            }
            "FTDI_STARTUP_SLEEP" => self.ftdi.startup_sleep_ms = int(value)? as u32,
            "FTDI_JTAG_FREQ" => {
                self.ftdi.jtag_freq_hz = value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .or_else(|| parse_int(value).map(|v| v as f64))
                    .ok_or_else(|| bad_value("expected a frequency in Hz"))?
            }
            "FTDI_GPIO_MASK" => {
                self.ftdi.gpio_mask =
                    int(value)?.try_into().map_err(|_| bad_value("expected a 16-bit mask"))?
            }
            "FTDI_GPIO_OUT" => {
                self.ftdi.gpio_out =
                    int(value)?.try_into().map_err(|_| bad_value("expected a 16-bit value"))?
            }
            "FTDI_ADAPTIVE_CLOCKING" => self.ftdi.adaptive_clocking = boolean(value)?,
            "FTDI_LOOPBACK_TEST" => self.ftdi.loopback_test = boolean(value)?,
            "XVC_HOST" => self.xvc.host = value.to_string(),
            "XVC_PORT" => {
                self.xvc.port = int(value)?.try_into().map_err(|_| bad_value("port out of range"))?
            }
            _ => return Err(ConfigError::UnknownKey { key: key.to_string() }),
        }
        Ok(())
    }

    /// Renders the sorted option table, the way the original tools echoed
    /// their effective configuration.
    pub fn dump(&self) -> String {
        let mut out = String::from("\nConfiguration options:\n\n");
        let mut push = |name: &str, value: String| {
            out.push_str(&format!("    {name:<28} = {value}\n"));
        };
        push("CABLE_DRIVER", format!("{:?}", self.cable_driver));
        push("CABLE_NAME", format!("{:?}", self.cable_name));
        push("FTDI_ADAPTIVE_CLOCKING", format!("{}", self.ftdi.adaptive_clocking));
        push("FTDI_GPIO_MASK", format!("{:#06x}", self.ftdi.gpio_mask));
        push("FTDI_GPIO_OUT", format!("{:#06x}", self.ftdi.gpio_out));
        push("FTDI_JTAG_FREQ", format!("{:.2e}", self.ftdi.jtag_freq_hz));
        push("FTDI_LATENCY_TIMER", format!("{}", self.ftdi.latency_timer));
        push("FTDI_LOOPBACK_TEST", format!("{}", self.ftdi.loopback_test));
        push("FTDI_READ_TIMEOUT", format!("{}", self.ftdi.read_timeout_ms));
        push("FTDI_STARTUP_SLEEP", format!("{}", self.ftdi.startup_sleep_ms));
        push("FTDI_USB_IN_SIZE", format!("{}", self.ftdi.usb_in_size));
        push("FTDI_USB_OUT_SIZE", format!("{}", self.ftdi.usb_out_size));
        push("FTDI_WRITE_TIMEOUT", format!("{}", self.ftdi.write_timeout_ms));
        push("JTAGID_FILE", format!("{:?}", self.jtagid_file));
        push("LOG_PACKETS", format!("{}", self.log_packets));
        push("SHOW_CHAIN", format!("{}", self.show_chain));
        push("SHOW_CONFIG", format!("{}", self.show_config));
        push("SOCKET_ADDRESS", format!("{}", self.socket_address));
        push("XVC_HOST", self.xvc.host.clone());
        push("XVC_PORT", format!("{}", self.xvc.port));
        out
    }
}
