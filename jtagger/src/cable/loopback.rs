//! The loopback test transport.
//!
//! `Mirror` wires TDO straight to TDI, which is what an FPGA with a
//! mirrored USER register looks like to a round-trip test. `Tap` drives a
//! [`SimChain`], giving discovery and end-to-end tests a real state machine
//! to talk to.

use bitvec::prelude::*;

use super::sim::SimChain;
use crate::error::Error;
use crate::template::compiler::CompiledTemplate;

#[derive(Debug, Clone)]
enum Mode {
    Mirror,
    Tap(SimChain),
    /// TDO held at a fixed level, like a disconnected or shorted line.
    Stuck(bool),
    /// A different answer on every read; exercises consistency checks.
    Noisy(u64),
}

#[derive(Debug)]
pub struct Loopback {
    mode: Mode,
    speed_khz: u32,
    scratch: BitVec<u8, Lsb0>,
}

impl Loopback {
    /// Plain wire: TDO reads back whatever was driven on TDI.
    pub fn mirror() -> Loopback {
        Loopback { mode: Mode::Mirror, speed_khz: 1000, scratch: BitVec::new() }
    }

    /// Drives a simulated chain instead of hardware.
    pub fn tap(chain: SimChain) -> Loopback {
        Loopback { mode: Mode::Tap(chain), speed_khz: 1000, scratch: BitVec::new() }
    }

    /// TDO stuck at `level` regardless of input.
    pub fn stuck_at(level: bool) -> Loopback {
        Loopback { mode: Mode::Stuck(level), speed_khz: 1000, scratch: BitVec::new() }
    }

    /// Returns a different bit pattern on every exchange.
    pub fn noisy() -> Loopback {
        Loopback { mode: Mode::Noisy(0), speed_khz: 1000, scratch: BitVec::new() }
    }

    pub(crate) fn speed_khz(&self) -> u32 {
        self.speed_khz
    }

    pub(crate) fn set_speed_khz(&mut self, speed_khz: u32) -> u32 {
        self.speed_khz = speed_khz;
        self.speed_khz
    }

    pub(crate) fn execute(
        &mut self,
        plan: &CompiledTemplate,
        values: &[u64],
    ) -> Result<Vec<BitVec<u8, Lsb0>>, Error> {
        plan.combine(values, &mut self.scratch)?;
        let clocks = plan.clocks();
        let mut response: BitVec<u8, Lsb0> = BitVec::repeat(false, plan.read_bytes * 8);
        match &mut self.mode {
            Mode::Mirror => {
                response[..clocks].copy_from_bitslice(&self.scratch[..clocks]);
            }
            Mode::Tap(chain) => {
                for i in 0..clocks {
                    let tdo = chain.clock(plan.tms_plan[i], self.scratch[i]);
                    response.set(i, tdo);
                }
            }
            Mode::Stuck(level) => {
                response[..clocks].fill(*level);
            }
            Mode::Noisy(counter) => {
                *counter += 1;
                let fill = clocks.min(8);
                let value = (*counter | 1) & ((1 << fill) - 1);
                response[..fill].store_le::<u64>(value);
            }
        }
        Ok(plan.extract(&response))
    }
}
