//! Chain discovery.
//!
//! Probes an unknown chain and infers the number of devices, their IDCODEs
//! and the per-device instruction register lengths from what comes back on
//! TDO, then reconciles the result with the parts database. Every probe is
//! repeated and must be bit-identical; a quiescent chain answers the same
//! way every time.

use std::collections::BTreeSet;

use bitvec::prelude::*;
use itertools::Itertools;

use crate::cable::Cable;
use crate::error::Error;
use crate::parts::{PartDatabase, PartInfo};
use crate::template::{JtagTemplate, Tdi};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("inconsistent JTAG reads ({op})")]
    InconsistentRead { op: &'static str },

    #[error("JTAG chain stuck at {level} ({op})")]
    ChainStuck { op: &'static str, level: u8 },

    #[error("JTAG chain has more than {max} devices in it")]
    ChainTooLong { max: usize },

    #[error("empty JTAG chain -- {what}")]
    EmptyChain { what: &'static str },

    #[error("truncated IDCODE in scan data")]
    TruncatedIdCode,

    #[error("unexpectedly long instruction register")]
    IrTooLong,

    #[error("illegal last device in chain: IR capture must begin with 1")]
    IllegalLastDevice,

    #[error("broken instruction register: expected {expected} devices")]
    BrokenIr { expected: usize },

    #[error("ambiguous IR partitioning: {candidates} candidate(s) remain")]
    AmbiguousChain { candidates: usize },
}

/// Discovery tunables; the defaults match decades of 1149.1 practice.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Initial capacity guess, in devices with IDCODEs; doubles on demand.
    pub min_devices_idcode: usize,
    pub max_devices_idcode: usize,
    /// Extra capacity for devices answering in BYPASS.
    pub max_devices_bypass: usize,
    /// Longest plausible per-device IR.
    pub max_irbits: usize,
    /// At least BYPASS, EXTEST and SAMPLE must be encodable.
    pub min_irbits: usize,
    pub repeat_count: usize,
}

impl Default for ScanOptions {
    fn default() -> ScanOptions {
        ScanOptions {
            min_devices_idcode: 2,
            max_devices_idcode: 32,
            max_devices_bypass: 32,
            max_irbits: 10,
            min_irbits: 2,
            repeat_count: 4,
        }
    }
}

/// A validated chain description. Index 0 is the device nearest TDO, the
/// first to answer on a shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    parts: Vec<PartInfo>,
    ir_len: usize,
}

impl Chain {
    /// Probes the chain behind `cable` and reconciles it with `db`.
    pub fn discover(
        cable: &mut Cable,
        db: &PartDatabase,
        options: ScanOptions,
    ) -> Result<Chain, Error> {
        let mut scanner = Scanner { cable, min_devices: options.min_devices_idcode, options };

        let dr = scanner.repeat_read("IDCODE", Scanner::read_ids)?;
        let idcodes = find_idcodes(&dr)?;
        let numdevs = idcodes.len();
        tracing::info!("found {numdevs} device(s) on the chain");

        let ir = scanner.repeat_read("IR", |s| s.read_ir(numdevs))?;
        let mut partitions = find_ir_lengths(&ir, numdevs, &scanner.options)?;
        if partitions.len() > 1 && has_duplicates(&idcodes) {
            strip_duplicate_disagreements(&mut partitions, &idcodes);
        }

        let mut captures: BTreeSet<Vec<(usize, u64)>> =
            partitions.iter().map(|lengths| capture_values(&ir, lengths)).collect();

        let mut parts: Vec<PartInfo> =
            idcodes.iter().map(|&id| db.lookup(id.unwrap_or(0))).collect();
        constrain_by_parts(&mut captures, &parts);
        if captures.len() != 1 {
            tracing::error!(
                "cannot partition the IR read; {} candidate(s) survive the parts database",
                captures.len()
            );
            return Err(ScanError::AmbiguousChain { candidates: captures.len() }.into());
        }
        let capture = captures.into_iter().next().unwrap();

        let ir_len = capture.iter().map(|&(len, _)| len).sum();
        apply_captures(&mut parts, &capture);
        Ok(Chain { parts, ir_len })
    }

    pub fn parts(&self) -> &[PartInfo] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Total length of the concatenated instruction register.
    pub fn ir_len(&self) -> usize {
        self.ir_len
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\nJTAG Chain information\n")?;
        for (i, part) in self.parts.iter().enumerate() {
            writeln!(f, "   #{i} - {part}")?;
        }
        Ok(())
    }
}

struct Scanner<'a> {
    cable: &'a mut Cable,
    options: ScanOptions,
    /// Grows as the capacity search doubles; sticky across repeats.
    min_devices: usize,
}

impl Scanner<'_> {
    /// Runs `probe` several times; a quiescent chain must answer
    /// identically every time.
    fn repeat_read<F>(&mut self, op: &'static str, probe: F) -> Result<BitVec<u8, Lsb0>, Error>
    where
        F: Fn(&mut Self) -> Result<BitVec<u8, Lsb0>, Error>,
    {
        let first = probe(self)?;
        for _ in 1..self.options.repeat_count {
            let again = probe(self)?;
            if again != first {
                return Err(ScanError::InconsistentRead { op }.into());
            }
        }
        Ok(first)
    }

    /// Shifts a marker bit followed by zeros through the DR chain from
    /// reset, growing the capacity until the tail reads back clean.
    fn read_ids(&mut self) -> Result<BitVec<u8, Lsb0>, Error> {
        loop {
            let maxlen = 32 * self.min_devices + self.options.max_devices_bypass + 1;
            let mut t = JtagTemplate::new();
            t.read_dr(maxlen + 33, Tdi::Int(1), true)?;
            let bits = single_value(t.run(self.cable, &[])?);
            if check_read(&bits, maxlen, "IDCODE")? {
                return Ok(bits);
            }
            if self.min_devices >= self.options.max_devices_idcode {
                return Err(ScanError::ChainTooLong { max: self.options.max_devices_idcode }.into());
            }
            self.min_devices = (self.min_devices * 2).min(self.options.max_devices_idcode);
        }
    }

    /// One long IR shift from reset; every device presents its capture.
    fn read_ir(&mut self, numdevs: usize) -> Result<BitVec<u8, Lsb0>, Error> {
        let maxlen = numdevs * self.options.max_irbits + 1;
        let mut t = JtagTemplate::new();
        t.read_ir(maxlen + self.options.max_irbits + 1, Tdi::Int(1), true)?;
        let bits = single_value(t.run(self.cable, &[])?);
        if !check_read(&bits, maxlen, "IR")? {
            return Err(ScanError::IrTooLong.into());
        }
        Ok(bits)
    }
}

fn single_value(mut values: Vec<BitVec<u8, Lsb0>>) -> BitVec<u8, Lsb0> {
    debug_assert_eq!(values.len(), 1);
    values.pop().unwrap_or_default()
}

/// Stuck-line detection plus the capacity check: the read fits if nothing
/// beyond `maxlen` came back high.
fn check_read(bits: &BitSlice<u8, Lsb0>, maxlen: usize, op: &'static str) -> Result<bool, ScanError> {
    if bits.not_any() {
        return Err(ScanError::ChainStuck { op, level: 0 });
    }
    if bits[..maxlen].all() {
        return Err(ScanError::ChainStuck { op, level: 1 });
    }
    Ok(!bits[maxlen..].any())
}

/// Decodes the reset DR capture: a leading 1 introduces a 32-bit IDCODE, a
/// leading 0 is a device in BYPASS. The marker bit we shifted in bounds the
/// stream.
fn find_idcodes(bits: &BitSlice<u8, Lsb0>) -> Result<Vec<Option<u32>>, ScanError> {
    let marker = bits.last_one().expect("checked against all-zero");
    let mut dr = &bits[..marker];
    let mut devices = Vec::new();
    while !dr.is_empty() {
        if dr[0] {
            if dr.len() < 32 {
                tracing::error!("truncated IDCODE: {dr:b}");
                return Err(ScanError::TruncatedIdCode);
            }
            let idcode = dr[..32].load_le::<u32>();
            tracing::info!("found IDCODE {idcode:#010X}");
            devices.push(Some(idcode));
            dr = &dr[32..];
        } else {
            tracing::info!("found device in BYPASS");
            devices.push(None);
            dr = &dr[1..];
        }
    }
    if devices.is_empty() {
        return Err(ScanError::EmptyChain { what: "data" });
    }
    Ok(devices)
}

/// Enumerates every plausible way to cut the IR capture into per-device
/// registers. Capture LSBs are always 1, so the 1-bit positions below the
/// marker are the candidate boundaries.
fn find_ir_lengths(
    ir: &BitSlice<u8, Lsb0>,
    numdevs: usize,
    options: &ScanOptions,
) -> Result<BTreeSet<Vec<usize>>, ScanError> {
    let mut ones: Vec<usize> = ir.iter_ones().collect();
    let total = ones.pop().expect("checked against all-zero");
    if ones.is_empty() {
        return Err(ScanError::EmptyChain { what: "instruction" });
    }
    if ones[0] != 0 {
        return Err(ScanError::IllegalLastDevice);
    }
    if ones.len() < numdevs {
        tracing::error!("expected {numdevs} devices in IR capture: {ir:b}");
        return Err(ScanError::BrokenIr { expected: numdevs });
    }
    if numdevs == 1 {
        return Ok(BTreeSet::from([vec![total]]));
    }
    let mut partitions = BTreeSet::new();
    for combo in ones[1..].iter().combinations(numdevs - 1) {
        let mut bounds = vec![0usize];
        bounds.extend(combo.iter().map(|&&b| b));
        bounds.push(total);
        let lengths: Vec<usize> = bounds.windows(2).map(|w| w[1] - w[0]).collect();
        if lengths.iter().all(|&len| len >= options.min_irbits) {
            partitions.insert(lengths);
        }
    }
    Ok(partitions)
}

fn has_duplicates(idcodes: &[Option<u32>]) -> bool {
    let known: Vec<u32> = idcodes.iter().filter_map(|&id| id).collect();
    known.iter().collect::<std::collections::HashSet<_>>().len() != known.len()
}

/// Two devices with the same IDCODE have the same IR length; drop any
/// partition that says otherwise.
fn strip_duplicate_disagreements(partitions: &mut BTreeSet<Vec<usize>>, idcodes: &[Option<u32>]) {
    let mut groups: std::collections::HashMap<u32, Vec<usize>> = std::collections::HashMap::new();
    for (index, id) in idcodes.iter().enumerate() {
        if let Some(id) = id {
            groups.entry(*id).or_default().push(index);
        }
    }
    partitions.retain(|lengths| {
        groups.values().filter(|indexes| indexes.len() > 1).all(|indexes| {
            indexes.iter().map(|&i| lengths[i]).all_equal()
        })
    });
}

/// Slices the IR capture per a candidate partition.
fn capture_values(ir: &BitSlice<u8, Lsb0>, lengths: &[usize]) -> Vec<(usize, u64)> {
    let mut shift = 0;
    lengths
        .iter()
        .map(|&len| {
            let value = ir[shift..shift + len].load_le::<u64>();
            shift += len;
            (len, value)
        })
        .collect()
}

/// Discards candidates contradicting what the database knows about each
/// identified part. Unknown parts constrain nothing.
fn constrain_by_parts(captures: &mut BTreeSet<Vec<(usize, u64)>>, parts: &[PartInfo]) {
    for (index, part) in parts.iter().enumerate() {
        if captures.len() <= 1 {
            break;
        }
        let possible = part.possible_ir();
        if possible.is_empty() {
            continue;
        }
        captures.retain(|candidate| possible.contains(&candidate[index]));
    }
}

/// Writes the observed captures back into the part records, warning where
/// the database expected something else.
fn apply_captures(parts: &mut [PartInfo], captures: &[(usize, u64)]) {
    debug_assert_eq!(parts.len(), captures.len());
    for (index, (part, &(len, value))) in parts.iter_mut().zip(captures).enumerate() {
        let expected = part.possible_ir();
        let observed: String =
            (0..len).rev().map(|bit| if value >> bit & 1 != 0 { '1' } else { '0' }).collect();
        if !part.ir_capture.is_empty() && !expected.contains(&(len, value)) {
            tracing::warn!(
                "expected IR capture {:?} for part at chain index {index}: {part}",
                part.ir_capture
            );
        }
        part.ir_capture = observed;
        part.ir_len = len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::loopback::Loopback;
    use crate::cable::sim::{SimChain, SimDevice};
    use crate::parts::PartDatabase;

    fn tap(devices: Vec<SimDevice>) -> Cable {
        Cable::Loopback(Loopback::tap(SimChain::new(devices)))
    }

    fn artix() -> SimDevice {
        SimDevice::new(6, 0x1363_1093, 0b110101)
    }

    #[test]
    fn single_device_chain() {
        let mut cable = tap(vec![artix()]);
        let chain = Chain::discover(&mut cable, &PartDatabase::builtin(), Default::default())
            .unwrap();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain.ir_len(), 6);
        let part = &chain.parts()[0];
        assert_eq!(part.idcode, 0x1363_1093);
        // Low 12 bits: Xilinx manufacturer code 0x49, shifted, LSB high.
        assert_eq!(part.idcode & 0xFFF, 0x093);
        assert_eq!(part.name, "XC7A200T");
        assert_eq!(part.manufacturer, "Xilinx");
        assert_eq!(part.ir_capture, "110101");
        assert_eq!(part.ir_len, 6);
    }

    #[test]
    fn two_device_chain_partitions_by_capture_ones() {
        // B (IR=8) nearest TDI, A (IR=6) nearest TDO; the capture stream
        // leads with A. The parts database disambiguates the split.
        let parts = "\
            xxxx0011011000110001000010010011 xx0101 Part A\n\
            xxxx0110010000110011000001000001 00000001 Part B\n";
        let db = PartDatabase::from_strs(parts, "").unwrap();

        let b = SimDevice::new(8, 0x0643_3041, 0b0000_0001);
        let a = SimDevice::new(6, 0x1363_1093, 0b000101);
        let mut cable = tap(vec![b, a]);
        let chain = Chain::discover(&mut cable, &db, Default::default()).unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.ir_len(), 14);
        assert_eq!(chain.parts()[0].name, "Part A");
        assert_eq!(chain.parts()[0].ir_len, 6);
        assert_eq!(chain.parts()[0].ir_capture, "000101");
        assert_eq!(chain.parts()[1].name, "Part B");
        assert_eq!(chain.parts()[1].ir_len, 8);
        assert_eq!(chain.parts()[1].ir_capture, "00000001");
        // Both captures end in the mandatory 01.
        for part in chain.parts() {
            assert!(part.ir_capture.ends_with("01"));
        }
    }

    #[test]
    fn ambiguous_without_database_knowledge() {
        let b = SimDevice::new(8, 0x0643_3041, 0b0000_0001);
        let a = SimDevice::new(6, 0x1363_1093, 0b000101);
        let mut cable = tap(vec![b, a]);
        let err =
            Chain::discover(&mut cable, &PartDatabase::default(), Default::default()).unwrap_err();
        assert!(err.to_string().contains("ambiguous"), "{err}");
    }

    #[test]
    fn bypass_device_between_idcodes() {
        let mut cable = tap(vec![artix(), SimDevice::without_idcode(4, 0b0001), artix()]);
        let parts = "xxxx0011011000110001000010010011 xx0101 Artix\n";
        let db = PartDatabase::from_strs(parts, "").unwrap();
        let chain = Chain::discover(&mut cable, &db, Default::default()).unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.parts()[1].idcode, 0);
        assert_eq!(chain.parts()[1].name, "(unknown part)");
        assert_eq!(chain.parts()[1].ir_len, 4);
        assert_eq!(chain.ir_len(), 16);
    }

    #[test]
    fn stuck_low_chain_names_the_operation() {
        let mut cable = Cable::Loopback(Loopback::stuck_at(false));
        let err = Chain::discover(&mut cable, &PartDatabase::builtin(), Default::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("stuck at 0"), "{message}");
        assert!(message.contains("IDCODE"), "{message}");
    }

    #[test]
    fn stuck_high_chain_is_detected() {
        let mut cable = Cable::Loopback(Loopback::stuck_at(true));
        let err = Chain::discover(&mut cable, &PartDatabase::builtin(), Default::default())
            .unwrap_err();
        assert!(err.to_string().contains("stuck at 1"), "{}", err);
    }

    #[test]
    fn noisy_chain_is_inconsistent() {
        let mut cable = Cable::Loopback(Loopback::noisy());
        let err = Chain::discover(&mut cable, &PartDatabase::builtin(), Default::default())
            .unwrap_err();
        assert!(err.to_string().contains("nconsistent"), "{}", err);
    }

    #[test]
    fn oversized_chain_is_rejected() {
        let mut cable = tap((0..40).map(|_| artix()).collect());
        let err = Chain::discover(&mut cable, &PartDatabase::builtin(), Default::default())
            .unwrap_err();
        assert!(err.to_string().contains("more than 32"), "{}", err);
    }

    #[test]
    fn discovery_is_stable() {
        let db = PartDatabase::builtin();
        let mut cable = tap(vec![artix(), artix()]);
        let first = Chain::discover(&mut cable, &db, Default::default()).unwrap();
        let second = Chain::discover(&mut cable, &db, Default::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn chain_dump_lists_parts_in_order() {
        let mut cable = tap(vec![artix()]);
        let chain = Chain::discover(&mut cable, &PartDatabase::builtin(), Default::default())
            .unwrap();
        let dump = format!("{chain}");
        assert!(dump.contains("JTAG Chain information"));
        assert!(dump.contains("#0 - Xilinx XC7A200T"));
    }
}
