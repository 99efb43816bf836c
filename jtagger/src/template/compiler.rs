//! Lowering of templates into cable-specific wire programs.
//!
//! Compilation produces three aligned per-clock plans (TMS, TDI, TDO) and
//! then rewrites them for the target transport: the raw style packs TMS and
//! TDI into byte frames for cables that move naked bit streams (XVC,
//! loopback); the MPSSE style lowers everything into a single FTDI command
//! program with opcode bytes spliced between the data, the way the hardware
//! wants to consume it.
//!
//! The compiled plan carries a prebuilt *combiner* (constant output bits
//! plus the positions each caller value occupies) and *extractor* (the
//! captured spans of the response stream and the widths of the requested
//! values). Combining writes into a reusable scratch buffer, so executing a
//! template does not allocate on the hot path.

use bitvec::prelude::*;

use super::{BuildError, JtagTemplate, Tdi, MAX_VALUE_BITS};

/// One position of the TDI plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanBit {
    Zero,
    One,
    /// Filled from caller data when the template runs.
    Variable,
    /// Don't care; rendered as zero on the wire.
    DontCare,
}

/// The flavour of wire program a cable consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanStyle {
    /// Byte-packed TMS and TDI frames, bit i of the frame being clock i.
    Raw,
    /// MPSSE command stream, batched to the chip's buffer size.
    Mpsse { buffer_size: usize },
}

/// A variable TDI entry: `bits` caller bits scattered over the runs of the
/// outgoing stream, value bit 0 first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VarEntry {
    pub bits: usize,
    pub runs: Vec<(usize, usize)>,
}

/// A contiguous slice of the outgoing stream and the response bytes that
/// must be collected before more of it may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Batch {
    /// Exclusive end of the outgoing range, in bytes.
    pub out_end: usize,
    /// Exclusive end of the expected response, in bytes.
    pub read_end: usize,
}

/// A frozen, executable rendition of one template.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub(crate) style: PlanStyle,
    pub(crate) clocks: usize,

    // The three aligned per-clock plans, kept for diagnostics and for
    // transports that execute clock-by-clock.
    pub(crate) tms_plan: BitVec,
    pub(crate) tdi_plan: Vec<PlanBit>,
    pub(crate) capture_mask: BitVec,

    /// Packed TMS frame (raw style only).
    pub(crate) tms_frame: Vec<u8>,
    /// Constant bits of the outgoing stream; variable positions are zero.
    pub(crate) out_bits: BitVec<u8, Lsb0>,
    pub(crate) var_entries: Vec<VarEntry>,
    pub(crate) batches: Vec<Batch>,
    /// Total response bytes the cable must collect.
    pub(crate) read_bytes: usize,
    /// Captured spans of the response stream, in capture order.
    pub(crate) capture_spans: Vec<(usize, usize)>,
    /// Width of each caller-visible value, in request order.
    pub(crate) value_bits: Vec<usize>,
}

impl CompiledTemplate {
    pub fn clocks(&self) -> usize {
        self.clocks
    }

    /// Number of values the caller must supply per execution.
    pub fn variable_count(&self) -> usize {
        self.var_entries.len()
    }

    /// Merges caller values into the constant outgoing stream.
    pub(crate) fn combine(
        &self,
        values: &[u64],
        out: &mut BitVec<u8, Lsb0>,
    ) -> Result<(), BuildError> {
        if values.len() != self.var_entries.len() {
            return Err(BuildError::WrongValueCount {
                expected: self.var_entries.len(),
                got: values.len(),
            });
        }
        out.clear();
        out.extend_from_bitslice(&self.out_bits);
        for (entry, &value) in self.var_entries.iter().zip(values) {
            if entry.bits < MAX_VALUE_BITS && value >> entry.bits != 0 {
                return Err(BuildError::ValueTooWide { bits: entry.bits, value });
            }
            let mut cursor = 0;
            for &(start, len) in &entry.runs {
                out[start..start + len].store_le::<u64>((value >> cursor) & mask(len));
                cursor += len;
            }
            debug_assert_eq!(cursor, entry.bits);
        }
        out.set_uninitialized(false);
        Ok(())
    }

    /// Slices the captured spans of a response back into the caller's
    /// values, in request order, little-endian within each value.
    pub(crate) fn extract(&self, response: &BitSlice<u8, Lsb0>) -> Vec<BitVec<u8, Lsb0>> {
        let total: usize = self.capture_spans.iter().map(|&(_, len)| len).sum();
        let mut dense: BitVec<u8, Lsb0> = BitVec::with_capacity(total);
        for &(start, len) in &self.capture_spans {
            dense.extend_from_bitslice(&response[start..start + len]);
        }
        let mut values = Vec::with_capacity(self.value_bits.len());
        let mut pos = 0;
        for &len in &self.value_bits {
            values.push(dense[pos..pos + len].to_bitvec());
            pos += len;
        }
        debug_assert_eq!(pos, dense.len());
        values
    }
}

impl std::fmt::Display for CompiledTemplate {
    /// Renders the three plans in the wire convention: the first clock sent
    /// is the rightmost character.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tms: String =
            self.tms_plan.iter().by_vals().rev().map(|b| if b { '1' } else { '0' }).collect();
        let tdi: String = self
            .tdi_plan
            .iter()
            .rev()
            .map(|b| match b {
                PlanBit::Zero => '0',
                PlanBit::One => '1',
                PlanBit::Variable => 'x',
                PlanBit::DontCare => '*',
            })
            .collect();
        let tdo: String =
            self.capture_mask.iter().by_vals().rev().map(|b| if b { 'x' } else { '*' }).collect();
        writeln!(f, "tms: {tms}")?;
        writeln!(f, "tdi: {tdi}")?;
        write!(f, "tdo: {tdo}")
    }
}

fn mask(len: usize) -> u64 {
    if len >= 64 { u64::MAX } else { (1u64 << len) - 1 }
}

/// Lowers a frozen template for the given plan style.
pub(crate) fn compile(tpl: &JtagTemplate, style: PlanStyle) -> Result<CompiledTemplate, BuildError> {
    let clocks = tpl.tms.len();

    // Normalise the TDI entries into one per-clock plan. Literals pass
    // through, integers render fixed-width, the all-ones sentinel expands,
    // variables mark their positions.
    let mut tdi_plan: Vec<PlanBit> = Vec::with_capacity(clocks);
    let mut entries: Vec<(usize, usize)> = Vec::new();
    for (bits, src) in &tpl.tdi {
        let bits = *bits;
        match src {
            Tdi::Bits(bv) => {
                if bv.len() != bits {
                    return Err(BuildError::LengthMismatch { expected: bits, got: bv.len() });
                }
                tdi_plan.extend(bv.iter().by_vals().map(|b| if b { PlanBit::One } else { PlanBit::Zero }));
            }
            Tdi::Int(value) => {
                if bits < MAX_VALUE_BITS && value >> bits != 0 {
                    return Err(BuildError::ValueTooWide { bits, value: *value });
                }
                tdi_plan.extend((0..bits).map(|j| {
                    if j < MAX_VALUE_BITS && value >> j & 1 != 0 { PlanBit::One } else { PlanBit::Zero }
                }));
            }
            Tdi::AllOnes => tdi_plan.extend(std::iter::repeat(PlanBit::One).take(bits)),
            Tdi::Variable => {
                if bits > MAX_VALUE_BITS {
                    return Err(BuildError::VariableTooWide { bits });
                }
                entries.push((tdi_plan.len(), bits));
                tdi_plan.extend(std::iter::repeat(PlanBit::Variable).take(bits));
            }
        }
    }
    if tdi_plan.len() != clocks {
        return Err(BuildError::LengthMismatch { expected: clocks, got: tdi_plan.len() });
    }

    // Resolve the relative capture offsets into a per-clock mask.
    let mut capture_mask = bitvec![0; clocks];
    let mut value_bits = Vec::with_capacity(tpl.tdo.len());
    let mut clock_spans = Vec::with_capacity(tpl.tdo.len());
    let mut start = 0usize;
    for &(ofs, len) in &tpl.tdo {
        start += ofs;
        if start + len > clocks {
            return Err(BuildError::LengthMismatch { expected: clocks, got: start + len });
        }
        capture_mask[start..start + len].fill(true);
        clock_spans.push((start, len));
        value_bits.push(len);
    }

    let mut plan = CompiledTemplate {
        style,
        clocks,
        tms_plan: tpl.tms.clone(),
        tdi_plan,
        capture_mask,
        tms_frame: Vec::new(),
        out_bits: BitVec::new(),
        var_entries: entries.iter().map(|&(_, bits)| VarEntry { bits, runs: Vec::new() }).collect(),
        batches: Vec::new(),
        read_bytes: 0,
        capture_spans: Vec::new(),
        value_bits,
    };

    match style {
        PlanStyle::Raw => lower_raw(&mut plan, &entries, &clock_spans),
        PlanStyle::Mpsse { buffer_size } => lower_mpsse(&mut plan, &entries, buffer_size),
    }
    Ok(plan)
}

/// Raw frames: bit i of each frame is clock i; trailing pad bits are zero.
fn lower_raw(plan: &mut CompiledTemplate, entries: &[(usize, usize)], spans: &[(usize, usize)]) {
    let clocks = plan.clocks;
    let frame_bytes = clocks.div_ceil(8);

    let mut tms: BitVec<u8, Lsb0> = BitVec::repeat(false, frame_bytes * 8);
    let mut out: BitVec<u8, Lsb0> = BitVec::repeat(false, frame_bytes * 8);
    for i in 0..clocks {
        tms.set(i, plan.tms_plan[i]);
        out.set(i, plan.tdi_plan[i] == PlanBit::One);
    }
    plan.tms_frame = tms.into_vec();
    plan.out_bits = out;

    for (entry, &(start, bits)) in plan.var_entries.iter_mut().zip(entries) {
        entry.runs.push((start, bits));
        debug_assert_eq!(entry.bits, bits);
    }

    plan.read_bytes = frame_bytes;
    plan.capture_spans = spans.to_vec();
    plan.batches = vec![Batch { out_end: frame_bytes, read_end: frame_bytes }];
}

/// Accumulates the MPSSE command program.
struct MpsseWriter<'a> {
    out: BitVec<u8, Lsb0>,
    runs: Vec<Vec<(usize, usize)>>,
    /// Meaningful bits in each response byte, in read order.
    in_counts: Vec<usize>,
    batches: Vec<Batch>,
    batch_start: usize,
    buffer_size: usize,
    entries: &'a [(usize, usize)],
    entry_cursor: usize,
}

impl MpsseWriter<'_> {
    /// Closes the current batch if `cmd_len` more bytes (plus the
    /// send-immediate opcode) would overflow the device buffer.
    fn fit(&mut self, cmd_len: usize) {
        let here = self.out.len() / 8;
        if here > self.batch_start && here - self.batch_start + cmd_len + 1 > self.buffer_size {
            self.batches.push(Batch { out_end: here, read_end: self.in_counts.len() });
            self.batch_start = here;
        }
    }

    fn finish(&mut self) {
        let here = self.out.len() / 8;
        if here > self.batch_start || self.batches.is_empty() {
            self.batches.push(Batch { out_end: here, read_end: self.in_counts.len() });
        }
    }

    fn const_byte(&mut self, byte: u8) {
        self.out.extend_from_bitslice(byte.view_bits::<Lsb0>());
    }

    /// Emits one output bit from the TDI plan, recording variable holes.
    fn plan_bit(&mut self, bit: PlanBit, clock: usize) {
        let pos = self.out.len();
        self.out.push(bit == PlanBit::One);
        if bit == PlanBit::Variable {
            while {
                let (start, bits) = self.entries[self.entry_cursor];
                clock >= start + bits
            } {
                self.entry_cursor += 1;
            }
            debug_assert!(clock >= self.entries[self.entry_cursor].0);
            let runs = &mut self.runs[self.entry_cursor];
            match runs.last_mut() {
                Some((start, len)) if *start + *len == pos => *len += 1,
                _ => runs.push((pos, 1)),
            }
        }
    }

    /// A data byte built from `count` plan bits (LSB first), zero padded.
    fn data_byte(&mut self, plan: &[PlanBit], clocks: std::ops::Range<usize>) {
        let count = clocks.len();
        debug_assert!(count <= 8);
        for clock in clocks {
            self.plan_bit(plan[clock], clock);
        }
        for _ in count..8 {
            self.out.push(false);
        }
    }
}

/// Lowers the per-clock plans into MPSSE commands.
///
/// Maximal TMS-low runs become clock-data commands (byte form where
/// possible); the remaining TMS-high runs become clock-TMS commands of at
/// most six bits carrying the (single) TDI level in bit 7. Commands split
/// wherever the capture flag or the TMS-run TDI level changes, and a
/// seven-bit data remainder is emitted as six bits plus one to sidestep the
/// classic FTDI quirk.
fn lower_mpsse(plan: &mut CompiledTemplate, entries: &[(usize, usize)], buffer_size: usize) {
    const CLOCK_DATA_BYTES: u8 = 0x19;
    const CLOCK_DATA_BITS: u8 = 0x1b;
    const CLOCK_TMS_BITS: u8 = 0x4b;
    const CAPTURE: u8 = 0x20;

    let clocks = plan.clocks;
    let tms = &plan.tms_plan;
    let tdi = &plan.tdi_plan;
    let cap = &plan.capture_mask;

    let mut w = MpsseWriter {
        out: BitVec::new(),
        runs: vec![Vec::new(); entries.len()],
        in_counts: Vec::new(),
        batches: Vec::new(),
        batch_start: 0,
        buffer_size,
        entries,
        entry_cursor: 0,
    };

    // The largest byte-form payload per command: bounded by the u16 length
    // field and by what fits in a batch alongside its 3-byte header.
    let max_data = 65536.min(buffer_size.saturating_sub(4)).max(1);

    let mut i = 0;
    while i < clocks {
        if !tms[i] {
            // Data run: maximal stretch of TMS-low clocks with one capture flag.
            let mut j = i + 1;
            while j < clocks && !tms[j] && cap[j] == cap[i] {
                j += 1;
            }
            let capture = if cap[i] { CAPTURE } else { 0 };
            let mut remaining = j - i;
            while remaining >= 8 {
                let nbytes = (remaining / 8).min(max_data);
                w.fit(3 + nbytes);
                w.const_byte(CLOCK_DATA_BYTES | capture);
                let [lo, hi] = ((nbytes - 1) as u16).to_le_bytes();
                w.const_byte(lo);
                w.const_byte(hi);
                for _ in 0..nbytes {
                    w.data_byte(tdi, i..i + 8);
                    i += 8;
                }
                if capture != 0 {
                    w.in_counts.extend(std::iter::repeat(8).take(nbytes));
                }
                remaining -= nbytes * 8;
            }
            // Remainder bits; seven need the 6+1 split.
            while remaining > 0 {
                let nbits = if remaining == 7 { 6 } else { remaining };
                w.fit(3);
                w.const_byte(CLOCK_DATA_BITS | capture);
                w.const_byte((nbits - 1) as u8);
                w.data_byte(tdi, i..i + nbits);
                i += nbits;
                if capture != 0 {
                    w.in_counts.push(nbits);
                }
                remaining -= nbits;
            }
        } else {
            // TMS run: up to six bits sharing one TDI level and capture flag.
            let mut j = i + 1;
            while j < clocks
                && j - i < 6
                && tms[j]
                && cap[j] == cap[i]
                && tdi[j] == tdi[i]
                && tdi[i] != PlanBit::Variable
            {
                j += 1;
            }
            let count = j - i;
            let capture = if cap[i] { CAPTURE } else { 0 };
            w.fit(3);
            w.const_byte(CLOCK_TMS_BITS | capture);
            w.const_byte((count - 1) as u8);
            for clock in i..j {
                w.out.push(tms[clock]);
            }
            for _ in count..7 {
                w.out.push(false);
            }
            w.plan_bit(tdi[i], i);
            if capture != 0 {
                w.in_counts.push(count);
            }
            i = j;
        }
    }
    w.finish();

    debug_assert_eq!(w.out.len() % 8, 0);
    plan.read_bytes = w.in_counts.len();
    plan.capture_spans = w
        .in_counts
        .iter()
        .enumerate()
        .map(|(byte, &count)| (byte * 8 + (8 - count), count))
        .collect();
    for (entry, runs) in plan.var_entries.iter_mut().zip(w.runs) {
        entry.runs = runs;
        debug_assert_eq!(entry.runs.iter().map(|&(_, len)| len).sum::<usize>(), entry.bits);
    }
    plan.out_bits = w.out;
    plan.out_bits.set_uninitialized(false);
    plan.batches = w.batches;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tap::TapState;
    use pretty_assertions::assert_eq;

    fn raw(tpl: &JtagTemplate) -> CompiledTemplate {
        compile(tpl, PlanStyle::Raw).unwrap()
    }

    fn mpsse(tpl: &JtagTemplate) -> CompiledTemplate {
        compile(tpl, PlanStyle::Mpsse { buffer_size: 4096 }).unwrap()
    }

    fn out_bytes(plan: &CompiledTemplate, values: &[u64]) -> Vec<u8> {
        let mut scratch = BitVec::new();
        plan.combine(values, &mut scratch).unwrap();
        scratch.into_vec()
    }

    #[test]
    fn plans_are_aligned() {
        let mut t = JtagTemplate::new();
        t.read_dr(32, Tdi::AllOnes, true).unwrap();
        for plan in [raw(&t), mpsse(&t)] {
            assert_eq!(plan.tms_plan.len(), plan.clocks);
            assert_eq!(plan.tdi_plan.len(), plan.clocks);
            assert_eq!(plan.capture_mask.len(), plan.clocks);
        }
    }

    #[test]
    fn raw_frames_pack_clock_order() {
        let mut t = JtagTemplate::starting_at(TapState::Idle);
        t.read_dr(8, 0xA5u64, true).unwrap();
        let plan = raw(&t);

        // idle -1,0,0-> shift-dr, 8 shifts (last advances), -1,1-> select-dr.
        assert_eq!(plan.clocks, 13);
        assert_eq!(plan.tms_frame.len(), 2);
        assert_eq!(plan.tms_frame, vec![0b0000_0001, 0b0001_1100]);

        // TDI: 0xA5 occupies clocks 3..11.
        let bytes = out_bytes(&plan, &[]);
        assert_eq!(bytes, vec![0b0010_1000, 0b0000_0101]);

        // The capture span covers exactly the shift clocks.
        assert_eq!(plan.capture_spans, vec![(3, 8)]);
        assert_eq!(plan.value_bits, vec![8]);
        assert_eq!(plan.read_bytes, 2);
    }

    #[test]
    fn combiner_fills_variable_runs() {
        let mut t = JtagTemplate::starting_at(TapState::ShiftDr);
        t.shift(8, Tdi::Variable, false, false).unwrap();
        t.shift(4, Tdi::Int(0b1001), false, false).unwrap();
        t.shift(8, Tdi::Variable, false, false).unwrap();
        let plan = raw(&t);

        assert_eq!(plan.variable_count(), 2);
        let bytes = out_bytes(&plan, &[0xFF, 0x00]);
        assert_eq!(bytes, vec![0xFF, 0b0000_1001, 0x00]);

        let err = plan.combine(&[1], &mut BitVec::new()).unwrap_err();
        assert!(matches!(err, BuildError::WrongValueCount { expected: 2, got: 1 }));

        let err = plan.combine(&[0x100, 0], &mut BitVec::new()).unwrap_err();
        assert!(matches!(err, BuildError::ValueTooWide { bits: 8, .. }));
    }

    #[test]
    fn extractor_slices_in_request_order() {
        let mut t = JtagTemplate::starting_at(TapState::ShiftDr);
        t.shift(8, Tdi::AllOnes, false, true).unwrap();
        t.shift(4, Tdi::AllOnes, false, false).unwrap();
        t.shift(4, Tdi::AllOnes, false, true).unwrap();
        let plan = raw(&t);

        let mut response = bitvec![u8, Lsb0; 0; 16];
        response[0..8].store_le(0x5Au8);
        response[12..16].store_le(0x0Fu8);
        let values = plan.extract(&response);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].load_le::<u64>(), 0x5A);
        assert_eq!(values[1].load_le::<u64>(), 0x0F);
    }

    #[test]
    fn mpsse_write_dr_command_stream() {
        let mut t = JtagTemplate::starting_at(TapState::Idle);
        t.write_dr(8, 0x55u64, true).unwrap();
        let plan = mpsse(&t);

        assert_eq!(
            out_bytes(&plan, &[]),
            vec![
                // idle -> select-dr
                0x4b, 0x00, 0x01,
                // capture, shift, and 7 data bits via the byte form
                0x19, 0x00, 0x00, 0x54,
                // 8th clock of the TMS-low run
                0x1b, 0x00, 0x01,
                // last data bit rides the exit transition, then on to select-dr
                0x4b, 0x02, 0x07,
            ]
        );
        assert_eq!(plan.read_bytes, 0);
        assert!(plan.capture_spans.is_empty());
    }

    #[test]
    fn mpsse_capture_accounting() {
        let mut t = JtagTemplate::starting_at(TapState::ShiftDr);
        t.shift(16, Tdi::AllOnes, false, true).unwrap();
        let plan = mpsse(&t);

        assert_eq!(out_bytes(&plan, &[]), vec![0x39, 0x01, 0x00, 0xFF, 0xFF]);
        assert_eq!(plan.read_bytes, 2);
        assert_eq!(plan.capture_spans, vec![(0, 8), (8, 8)]);
    }

    #[test]
    fn mpsse_seven_bit_remainder_splits() {
        let mut t = JtagTemplate::starting_at(TapState::ShiftDr);
        t.shift(7, Tdi::AllOnes, false, true).unwrap();
        let plan = mpsse(&t);

        assert_eq!(out_bytes(&plan, &[]), vec![0x3b, 0x05, 0x3F, 0x3b, 0x00, 0x01]);
        assert_eq!(plan.capture_spans, vec![(2, 6), (15, 1)]);
    }

    #[test]
    fn mpsse_variable_exit_bit_lands_in_tms_command() {
        let mut t = JtagTemplate::starting_at(TapState::ShiftDr);
        t.shift(8, Tdi::Variable, true, false).unwrap();
        let plan = mpsse(&t);

        // Six data bits, one more (the 6+1 split), then the last bit rides
        // bit 7 of the TMS command: three separate holes in the stream.
        assert_eq!(plan.var_entries.len(), 1);
        assert_eq!(plan.var_entries[0].bits, 8);
        assert_eq!(plan.var_entries[0].runs, vec![(16, 6), (40, 1), (71, 1)]);

        assert_eq!(out_bytes(&plan, &[0xFF]), vec![0x1b, 0x05, 0x3F, 0x1b, 0x00, 0x01, 0x4b, 0x00, 0x81]);
        assert_eq!(out_bytes(&plan, &[0x7F]), vec![0x1b, 0x05, 0x3F, 0x1b, 0x00, 0x01, 0x4b, 0x00, 0x01]);
    }

    #[test]
    fn mpsse_batches_respect_buffer_size() {
        let mut t = JtagTemplate::starting_at(TapState::ShiftDr);
        t.shift(64, Tdi::AllOnes, false, true).unwrap();
        let plan = compile(&t, PlanStyle::Mpsse { buffer_size: 8 }).unwrap();

        assert!(plan.batches.len() > 1);
        let mut prev = Batch { out_end: 0, read_end: 0 };
        for &batch in &plan.batches {
            assert!(batch.out_end > prev.out_end);
            assert!(batch.out_end - prev.out_end + 1 <= 8);
            assert!(batch.read_end >= prev.read_end);
            prev = batch;
        }
        assert_eq!(prev.out_end * 8, plan.out_bits.len());
        assert_eq!(prev.read_end, plan.read_bytes);
    }

    #[test]
    fn compiled_display_uses_wire_convention() {
        let mut t = JtagTemplate::starting_at(TapState::ShiftDr);
        t.shift(4, Tdi::Variable, false, true).unwrap();
        let plan = raw(&t);
        let rendered = format!("{plan}");
        assert_eq!(rendered, "tms: 0000\ntdi: xxxx\ntdo: xxxx");
    }
}
