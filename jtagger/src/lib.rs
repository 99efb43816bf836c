//! A JTAG host-side driver stack.
//!
//! jtagger turns high-level "read/write the instruction or data register"
//! requests into bit-exact TMS/TDI/TDO shift plans that walk the IEEE
//! 1149.1 TAP state machine, and executes those plans over pluggable
//! physical transports: FTDI MPSSE cables over USB, Xilinx Virtual Cable
//! servers over TCP, or a loopback for testing.
//!
//! ```no_run
//! use jtagger::{Cable, Chain, Config, JtagTemplate, PartDatabase, Tdi};
//!
//! # fn main() -> Result<(), jtagger::Error> {
//! let (config, _) = Config::from_args(["CABLE_DRIVER=ftdi", "CABLE_NAME=0"])?;
//! let mut cable = Cable::open(&config)?;
//!
//! let chain = Chain::discover(&mut cable, &PartDatabase::builtin(), Default::default())?;
//! println!("{chain}");
//!
//! // Templates compile once and rerun with fresh data.
//! let mut idcode = JtagTemplate::new();
//! idcode.read_dr(32, Tdi::AllOnes, true)?;
//! let words = idcode.run_words(&mut cable, &[])?;
//! println!("IDCODE: {:#010X}", words[0]);
//! # Ok(())
//! # }
//! ```

pub mod cable;
pub mod chain;
pub mod config;
mod error;
pub mod parts;
pub mod server;
pub mod tap;
pub mod template;

pub use crate::cable::Cable;
pub use crate::chain::{Chain, ScanError, ScanOptions};
pub use crate::config::{Config, ConfigError};
pub use crate::error::Error;
pub use crate::parts::{PartDatabase, PartInfo};
pub use crate::tap::TapState;
pub use crate::template::{BuildError, JtagTemplate, Tdi};
