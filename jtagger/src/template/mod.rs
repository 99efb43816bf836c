//! Reusable shift-plan templates.
//!
//! A [`JtagTemplate`] accumulates a path through the TAP state machine
//! together with the TDI bits to shift and the TDO spans to capture. It is
//! cheap to build, composable (concatenation, repetition, loops) and is
//! lowered into a cable-specific wire program on first execution. The
//! compiled plan is cached on the template and invalidated by any further
//! mutation, so a template can be executed any number of times with
//! different data.

pub mod compiler;

use std::sync::Arc;

use bitvec::prelude::*;

use crate::cable::Cable;
use crate::error::Error;
use crate::tap::{self, TapState};
use compiler::{CompiledTemplate, PlanStyle};

/// Largest width of a single variable TDI entry or captured value.
///
/// Wider transfers are expressed as multiple 64-bit lanes, which is how the
/// XVC server feeds arbitrary-length shifts through a template.
pub const MAX_VALUE_BITS: usize = 64;

/// Errors raised by illegal template composition.
///
/// These are programmer errors: they surface synchronously at the offending
/// builder call, never at execution time.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("mismatched state transitions on splice: {from} does not continue into {start}")]
    StateMismatch { from: TapState, start: TapState },

    #[error("template is not a closed cycle: ends in {last}, starts in {first}")]
    NotACycle { first: TapState, last: TapState },

    #[error("cannot shift data in {state}, not a shift state")]
    NotInShiftState { state: TapState },

    #[error("TDI literal is {got} bits, expected {expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("value {value:#x} does not fit in {bits} bits")]
    ValueTooWide { bits: usize, value: u64 },

    #[error("variable TDI entries are limited to {MAX_VALUE_BITS} bits, got {bits}")]
    VariableTooWide { bits: usize },

    #[error("expected {expected} TDI values, got {got}")]
    WrongValueCount { expected: usize, got: usize },

    #[error("no state is reachable from {from} toward {to}")]
    UnreachableState { from: TapState, to: TapState },

    #[error("end_loop without a matching begin_loop")]
    UnbalancedLoop,
}

/// One TDI entry: a fixed number of clocks with a bit source.
///
/// Literal bit-strings and integers are both accepted and only normalised
/// when the template is compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tdi {
    /// A literal bit pattern, one bit per clock, index 0 shifted first.
    Bits(BitVec),
    /// An integer shifted out LSB first, zero-extended to the entry width.
    Int(u64),
    /// Every clock shifts a one (the `-1` sentinel of the original tools).
    AllOnes,
    /// A caller-supplied value, bound at execution time.
    Variable,
}

impl Tdi {
    /// Parses a bit-string written MSB first (`"0101"`), the convention of
    /// the parts database and of JTAG documentation. The rightmost character
    /// is shifted first.
    pub fn bits(s: &str) -> Tdi {
        Tdi::Bits(s.chars().rev().map(|c| c == '1').collect())
    }
}

impl From<u64> for Tdi {
    fn from(value: u64) -> Tdi {
        Tdi::Int(value)
    }
}

impl From<i32> for Tdi {
    /// Accepts `-1` as the all-ones sentinel; other negatives are rejected
    /// at compile time by width validation.
    fn from(value: i32) -> Tdi {
        if value == -1 {
            Tdi::AllOnes
        } else {
            Tdi::Int(value as u32 as u64)
        }
    }
}

/// A declarative plan for one JTAG transaction.
#[derive(Debug, Clone)]
pub struct JtagTemplate {
    /// TMS level for each clock, index 0 first on the wire.
    pub(crate) tms: BitVec,
    /// TDI entries; bit counts sum to `tms.len()`.
    pub(crate) tdi: Vec<(usize, Tdi)>,
    /// Captured spans as (offset from previous span start, bit count).
    ///
    /// Offsets are kept relative so templates can be spliced without
    /// rewriting every entry.
    pub(crate) tdo: Vec<(usize, usize)>,
    /// Clock index of the most recent capture span start.
    pub(crate) prev_read: usize,
    /// Controller state after each clock; `states[0]` is the entry state,
    /// so `states.len() == tms.len() + 1`.
    pub(crate) states: Vec<TapState>,
    /// Lazily compiled wire program, invalidated on mutation.
    pub(crate) compiled: Option<(PlanStyle, Arc<CompiledTemplate>)>,
    loop_stack: Vec<JtagTemplate>,
}

impl Default for JtagTemplate {
    fn default() -> JtagTemplate {
        JtagTemplate::new()
    }
}

impl JtagTemplate {
    /// A fresh template. The controller state is unknown, so the first
    /// transition will include the hard-coded reset sequence.
    pub fn new() -> JtagTemplate {
        JtagTemplate::starting_at(TapState::Unknown)
    }

    /// A template that assumes the controller is already in `state`.
    pub fn starting_at(state: TapState) -> JtagTemplate {
        JtagTemplate {
            tms: BitVec::new(),
            tdi: Vec::new(),
            tdo: Vec::new(),
            prev_read: 0,
            states: vec![state],
            compiled: None,
            loop_stack: Vec::new(),
        }
    }

    /// Number of clocks this template drives.
    pub fn len(&self) -> usize {
        self.tms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tms.is_empty()
    }

    pub fn start_state(&self) -> TapState {
        self.states[0]
    }

    pub fn last_state(&self) -> TapState {
        *self.states.last().expect("states is never empty")
    }

    /// Number of variable TDI entries, i.e. values the caller must supply.
    pub fn variable_count(&self) -> usize {
        self.tdi.iter().filter(|(_, t)| matches!(t, Tdi::Variable)).count()
    }

    fn invalidate(&mut self) {
        self.compiled = None;
    }

    /// Extends TMS with the canonical transition to `state`.
    pub fn update(&mut self, state: TapState) -> Result<&mut Self, BuildError> {
        let from = self.last_state();
        let (bits, states) = tap::transition(from, state)
            .ok_or(BuildError::UnreachableState { from, to: state })?;
        if bits.is_empty() {
            return Ok(self);
        }
        self.invalidate();
        let numbits = bits.len();
        self.tms.extend_from_bitslice(&bits);
        self.states.extend(states);
        self.tdi.push((numbits, Tdi::Int(0)));
        Ok(self)
    }

    /// Enters `state` unless the template is already there.
    pub fn enter_state(&mut self, state: TapState) -> Result<&mut Self, BuildError> {
        if self.last_state() != state {
            self.update(state)?;
        }
        Ok(self)
    }

    /// After an advancing shift the controller sits in Exit1; this moves it
    /// on to Select-DR, the parking spot between operations.
    pub fn exit_state(&mut self, advance: bool) -> Result<&mut Self, BuildError> {
        if advance {
            self.update(TapState::SelectDr)?;
        }
        Ok(self)
    }

    /// Emits `numbits` shift clocks in the current shift state.
    ///
    /// The final clock's TMS is flipped when `advance` is set, exiting
    /// through Exit1. With `read`, the shifted-out bits are recorded as a
    /// capture span.
    pub fn shift(
        &mut self,
        numbits: usize,
        tdi: Tdi,
        advance: bool,
        read: bool,
    ) -> Result<&mut Self, BuildError> {
        let state = self.last_state();
        if !state.is_shifting() {
            return Err(BuildError::NotInShiftState { state });
        }
        if numbits == 0 {
            return Ok(self);
        }
        match &tdi {
            Tdi::Bits(bits) if bits.len() != numbits => {
                return Err(BuildError::LengthMismatch { expected: numbits, got: bits.len() });
            }
            Tdi::Int(value) if numbits < MAX_VALUE_BITS && value >> numbits != 0 => {
                return Err(BuildError::ValueTooWide { bits: numbits, value: *value });
            }
            Tdi::Variable if numbits > MAX_VALUE_BITS => {
                return Err(BuildError::VariableTooWide { bits: numbits });
            }
            _ => {}
        }
        self.invalidate();
        let start = self.tms.len();
        let cycle = state.cycle(numbits, advance).expect("checked to be a shift state");
        self.tms.extend_from_bitslice(&cycle);
        self.states.extend(std::iter::repeat(state).take(numbits));
        if advance {
            *self.states.last_mut().unwrap() = state.step(true);
        }
        self.tdi.push((numbits, tdi));
        if read {
            self.tdo.push((start - self.prev_read, numbits));
            self.prev_read = start;
        }
        Ok(self)
    }

    /// Loads `numbits` into the instruction register.
    pub fn write_ir(
        &mut self,
        numbits: usize,
        tdi: impl Into<Tdi>,
        advance: bool,
    ) -> Result<&mut Self, BuildError> {
        self.enter_state(TapState::ShiftIr)?
            .shift(numbits, tdi.into(), advance, false)?
            .exit_state(advance)
    }

    /// Shifts `numbits` through the data register.
    pub fn write_dr(
        &mut self,
        numbits: usize,
        tdi: impl Into<Tdi>,
        advance: bool,
    ) -> Result<&mut Self, BuildError> {
        self.enter_state(TapState::ShiftDr)?
            .shift(numbits, tdi.into(), advance, false)?
            .exit_state(advance)
    }

    /// Like [`write_ir`](Self::write_ir), but also captures the bits shifted
    /// out of the instruction register.
    pub fn read_ir(
        &mut self,
        numbits: usize,
        tdi: impl Into<Tdi>,
        advance: bool,
    ) -> Result<&mut Self, BuildError> {
        self.enter_state(TapState::ShiftIr)?
            .shift(numbits, tdi.into(), advance, true)?
            .exit_state(advance)
    }

    /// Like [`write_dr`](Self::write_dr), but also captures TDO.
    pub fn read_dr(
        &mut self,
        numbits: usize,
        tdi: impl Into<Tdi>,
        advance: bool,
    ) -> Result<&mut Self, BuildError> {
        self.enter_state(TapState::ShiftDr)?
            .shift(numbits, tdi.into(), advance, true)?
            .exit_state(advance)
    }

    /// Checks that replaying `other`'s TMS stream from this template's final
    /// state reproduces the states `other` was built against. Because the
    /// successor function is deterministic, agreeing on the first clock is
    /// agreeing on all of them.
    fn splice_ok(&self, other: &JtagTemplate) -> bool {
        if other.is_empty() {
            return true;
        }
        // A template that begins with a reset erases whatever came before.
        if other.start_state() == TapState::Unknown {
            return true;
        }
        self.last_state().step(other.tms[0]) == other.states[1]
    }

    /// Splices `other` onto the end of this template.
    ///
    /// Fails with [`BuildError::StateMismatch`] unless the join is
    /// consistent. Adjacent literal TDI entries are merged, and the spliced
    /// capture spans stay relative to their predecessors.
    pub fn append(&mut self, other: &JtagTemplate) -> Result<&mut Self, BuildError> {
        if other.is_empty() {
            return Ok(self);
        }
        if !self.splice_ok(other) {
            return Err(BuildError::StateMismatch {
                from: self.last_state(),
                start: other.start_state(),
            });
        }
        self.invalidate();
        let joint = self.tms.len();

        let mut rest = other.tdi.as_slice();
        if let (Some((tail_bits, Tdi::Bits(tail))), Some(((head_bits, Tdi::Bits(head)), more))) =
            (self.tdi.last_mut(), rest.split_first())
        {
            tail.extend_from_bitslice(head);
            *tail_bits += head_bits;
            rest = more;
        }
        self.tdi.extend(rest.iter().cloned());

        if !other.tdo.is_empty() {
            let (first_ofs, first_len) = other.tdo[0];
            self.tdo.push((first_ofs + joint - self.prev_read, first_len));
            self.tdo.extend_from_slice(&other.tdo[1..]);
            self.prev_read = joint + other.prev_read;
        }

        self.tms.extend_from_bitslice(&other.tms);
        self.states.extend_from_slice(&other.states[1..]);
        Ok(self)
    }

    /// `a + b` as a new template.
    pub fn concat(&self, other: &JtagTemplate) -> Result<JtagTemplate, BuildError> {
        let mut joined = self.clone();
        joined.loop_stack.clear();
        joined.append(other)?;
        Ok(joined)
    }

    /// Replicates this template `count` times.
    ///
    /// The template must be a closed cycle: replaying it from its own final
    /// state has to land back on its recorded path.
    pub fn repeat(&self, count: usize) -> Result<JtagTemplate, BuildError> {
        if count == 0 {
            return Ok(JtagTemplate::new());
        }
        if self.is_empty() || count == 1 {
            let mut out = self.clone();
            out.loop_stack.clear();
            return Ok(out);
        }
        if self.last_state().step(self.tms[0]) != self.states[1] {
            return Err(BuildError::NotACycle {
                first: self.start_state(),
                last: self.last_state(),
            });
        }
        let mut out = self.clone();
        out.loop_stack.clear();
        for _ in 1..count {
            out.append(self)?;
        }
        Ok(out)
    }

    /// Opens a loop scope. Everything built until the matching
    /// [`end_loop`](Self::end_loop) forms the loop body.
    pub fn begin_loop(&mut self) -> &mut Self {
        let fresh = JtagTemplate::starting_at(self.last_state());
        let prefix = self.replace_streams(fresh);
        self.loop_stack.push(prefix);
        self
    }

    /// Closes the innermost loop scope, repeating its body `count` times.
    /// Semantically equivalent to building the body standalone and
    /// multiplying it.
    pub fn end_loop(&mut self, count: usize) -> Result<&mut Self, BuildError> {
        let prefix = self.loop_stack.pop().ok_or(BuildError::UnbalancedLoop)?;
        let body = self.replace_streams(prefix);
        let repeated = body.repeat(count)?;
        self.append(&repeated)?;
        Ok(self)
    }

    fn replace_streams(&mut self, mut other: JtagTemplate) -> JtagTemplate {
        std::mem::swap(&mut self.tms, &mut other.tms);
        std::mem::swap(&mut self.tdi, &mut other.tdi);
        std::mem::swap(&mut self.tdo, &mut other.tdo);
        std::mem::swap(&mut self.prev_read, &mut other.prev_read);
        std::mem::swap(&mut self.states, &mut other.states);
        std::mem::swap(&mut self.compiled, &mut other.compiled);
        other.loop_stack = Vec::new();
        other
    }

    /// A template that replays a raw TMS stream with fully variable TDI and
    /// full TDO capture, both in 64-bit lanes. This is how the XVC server
    /// tunnels bit streams it does not interpret.
    pub fn passthrough(tms: &BitSlice<u8, Lsb0>) -> JtagTemplate {
        let mut t = JtagTemplate::starting_at(TapState::Unknown);
        t.tms = tms.iter().by_vals().collect();
        t.states = vec![TapState::Unknown; tms.len() + 1];
        let mut remaining = tms.len();
        let mut first = true;
        while remaining > 0 {
            let lane = remaining.min(MAX_VALUE_BITS);
            t.tdi.push((lane, Tdi::Variable));
            t.tdo.push((if first { 0 } else { MAX_VALUE_BITS }, lane));
            remaining -= lane;
            first = false;
        }
        if !t.tdo.is_empty() {
            t.prev_read = (t.tdo.len() - 1) * MAX_VALUE_BITS;
        }
        t
    }

    /// Sum of the TDI entry widths; always equals `len()`.
    pub(crate) fn tdi_bits(&self) -> usize {
        self.tdi.iter().map(|(n, _)| n).sum()
    }

    /// Compiles for `style`, reusing the cached plan when it matches.
    pub fn plan_for(&mut self, style: PlanStyle) -> Result<Arc<CompiledTemplate>, BuildError> {
        match &self.compiled {
            Some((cached, plan)) if *cached == style => Ok(plan.clone()),
            _ => {
                let plan = Arc::new(compiler::compile(self, style)?);
                self.compiled = Some((style, plan.clone()));
                Ok(plan)
            }
        }
    }

    /// Executes one synchronous bus round-trip and returns the captured
    /// values, one per requested span, little-endian bit order.
    ///
    /// A zero-length template produces no bus traffic and an empty list.
    pub fn run(
        &mut self,
        cable: &mut Cable,
        values: &[u64],
    ) -> Result<Vec<BitVec<u8, Lsb0>>, Error> {
        if self.is_empty() {
            if !values.is_empty() {
                return Err(BuildError::WrongValueCount { expected: 0, got: values.len() }.into());
            }
            return Ok(Vec::new());
        }
        let plan = self.plan_for(cable.plan_style())?;
        cable.execute(&plan, values)
    }

    /// Like [`run`](Self::run), for captures that fit in 64 bits each.
    pub fn run_words(&mut self, cable: &mut Cable, values: &[u64]) -> Result<Vec<u64>, Error> {
        let out = self.run(cable, values)?;
        Ok(out
            .iter()
            .map(|bits| {
                debug_assert!(bits.len() <= MAX_VALUE_BITS);
                bits.load_le::<u64>()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total_tdo(t: &JtagTemplate) -> usize {
        t.tdo.iter().map(|(_, n)| n).sum()
    }

    fn check_invariants(t: &JtagTemplate) {
        assert_eq!(t.tms.len() + 1, t.states.len());
        assert_eq!(t.tms.len(), t.tdi_bits());
        // Every capture span lies inside one contiguous shift phase.
        let mut start = 0usize;
        for &(ofs, len) in &t.tdo {
            start += ofs;
            for clock in start..start + len {
                assert!(
                    t.states[clock].is_shifting(),
                    "capture at clock {clock} outside a shift phase"
                );
            }
        }
    }

    #[test]
    fn fresh_template_resets_first() {
        let mut t = JtagTemplate::new();
        t.read_dr(32, Tdi::AllOnes, true).unwrap();
        check_invariants(&t);
        // 5 reset clocks, 1 into idle, 3 into shift-dr, 32 shifts, 2 to select-dr.
        assert_eq!(t.len(), 5 + 1 + 3 + 32 + 2);
        assert_eq!(t.last_state(), TapState::SelectDr);
        assert_eq!(total_tdo(&t), 32);
    }

    #[test]
    fn ir_then_dr_shares_path() {
        let mut t = JtagTemplate::starting_at(TapState::Idle);
        t.write_ir(6, Tdi::bits("100011"), true).unwrap();
        t.write_dr(32, 0xDEAD_BEEFu64, true).unwrap();
        check_invariants(&t);
        assert_eq!(t.last_state(), TapState::SelectDr);
        assert_eq!(t.variable_count(), 0);
    }

    #[test]
    fn shift_outside_shift_state_is_an_error() {
        let mut t = JtagTemplate::starting_at(TapState::Idle);
        let err = t.shift(8, Tdi::Int(0), false, false).unwrap_err();
        assert!(matches!(err, BuildError::NotInShiftState { state: TapState::Idle }));
    }

    #[test]
    fn literal_width_is_checked() {
        let mut t = JtagTemplate::starting_at(TapState::Idle);
        t.enter_state(TapState::ShiftDr).unwrap();
        let err = t.shift(8, Tdi::bits("0101"), false, false).unwrap_err();
        assert!(matches!(err, BuildError::LengthMismatch { expected: 8, got: 4 }));

        let err = t.shift(4, Tdi::Int(0x55), false, false).unwrap_err();
        assert!(matches!(err, BuildError::ValueTooWide { bits: 4, .. }));
    }

    #[test]
    fn splice_requires_consistent_transition() {
        // a ends still shifting; b advances out of shift-dr: consistent.
        let mut a = JtagTemplate::starting_at(TapState::Idle);
        a.enter_state(TapState::ShiftDr).unwrap();
        a.shift(8, Tdi::AllOnes, false, false).unwrap();
        assert_eq!(a.last_state(), TapState::ShiftDr);

        let mut b = JtagTemplate::starting_at(TapState::ShiftDr);
        b.shift(8, Tdi::AllOnes, true, false).unwrap();

        let joined = a.concat(&b).unwrap();
        check_invariants(&joined);
        assert_eq!(joined.last_state(), TapState::Exit1Dr);

        // a2 already advanced out of shift-dr; splicing b (which expects to
        // keep shifting with TMS low) is inconsistent.
        let mut a2 = JtagTemplate::starting_at(TapState::Idle);
        a2.enter_state(TapState::ShiftDr).unwrap();
        a2.shift(8, Tdi::AllOnes, true, false).unwrap();
        assert_eq!(a2.last_state(), TapState::Exit1Dr);

        let err = a2.concat(&b).unwrap_err();
        assert!(matches!(
            err,
            BuildError::StateMismatch { from: TapState::Exit1Dr, start: TapState::ShiftDr }
        ));
    }

    #[test]
    fn splice_through_exit2_reenters_shift() {
        let mut a = JtagTemplate::starting_at(TapState::Idle);
        a.enter_state(TapState::ShiftDr).unwrap();
        a.shift(4, Tdi::AllOnes, true, false).unwrap();
        a.update(TapState::Exit2Dr).unwrap();
        assert_eq!(a.last_state(), TapState::Exit2Dr);

        let mut b = JtagTemplate::starting_at(TapState::ShiftDr);
        b.shift(4, Tdi::AllOnes, false, false).unwrap();

        // Exit2-DR steps into Shift-DR on TMS=0, exactly what b records.
        let joined = a.concat(&b).unwrap();
        check_invariants(&joined);
        assert_eq!(joined.last_state(), TapState::ShiftDr);
    }

    #[test]
    fn reset_prefixed_template_splices_anywhere() {
        let mut a = JtagTemplate::starting_at(TapState::Idle);
        a.write_dr(8, 0u64, true).unwrap();

        let mut b = JtagTemplate::new();
        b.read_dr(8, Tdi::AllOnes, true).unwrap();

        let joined = a.concat(&b).unwrap();
        assert_eq!(joined.len(), a.len() + b.len());
    }

    #[test]
    fn append_merges_literal_tdi_entries() {
        let mut a = JtagTemplate::starting_at(TapState::ShiftDr);
        a.shift(4, Tdi::bits("1010"), false, false).unwrap();
        let mut b = JtagTemplate::starting_at(TapState::ShiftDr);
        b.shift(4, Tdi::bits("0011"), false, false).unwrap();

        let joined = a.concat(&b).unwrap();
        assert_eq!(joined.tdi.len(), 1);
        assert_eq!(joined.tdi[0].0, 8);
        // a's bits shift first, then b's.
        assert_eq!(joined.tdi[0].1, Tdi::bits("00111010"));
    }

    #[test]
    fn spliced_tdo_offsets_stay_relative() {
        let mut a = JtagTemplate::starting_at(TapState::ShiftDr);
        a.shift(8, Tdi::AllOnes, false, true).unwrap();
        let mut b = JtagTemplate::starting_at(TapState::ShiftDr);
        b.shift(4, Tdi::AllOnes, false, false).unwrap();
        b.shift(4, Tdi::AllOnes, false, true).unwrap();

        let joined = a.concat(&b).unwrap();
        // First span at clock 0, second at clock 12.
        assert_eq!(joined.tdo, vec![(0, 8), (12, 4)]);
        assert_eq!(joined.prev_read, 12);
    }

    #[test]
    fn repeat_requires_a_cycle() {
        let mut open = JtagTemplate::starting_at(TapState::Idle);
        open.enter_state(TapState::ShiftDr).unwrap();
        open.shift(4, Tdi::AllOnes, true, false).unwrap();
        assert!(matches!(open.repeat(3), Err(BuildError::NotACycle { .. })));

        // A shift that stays in the shift state cycles cleanly.
        let mut cycle = JtagTemplate::starting_at(TapState::ShiftDr);
        cycle.shift(4, Tdi::Variable, false, true).unwrap();
        let repeated = cycle.repeat(3).unwrap();
        check_invariants(&repeated);
        assert_eq!(repeated.len(), 12);
        assert_eq!(repeated.variable_count(), 3);
        assert_eq!(repeated.tdo, vec![(0, 4), (4, 4), (4, 4)]);
    }

    #[test]
    fn repeat_matches_explicit_concat() {
        let mut cycle = JtagTemplate::starting_at(TapState::ShiftDr);
        cycle.shift(8, Tdi::Variable, false, true).unwrap();

        let repeated = cycle.repeat(4).unwrap();
        let mut manual = cycle.clone();
        for _ in 0..3 {
            manual.append(&cycle).unwrap();
        }
        assert_eq!(repeated.tms, manual.tms);
        assert_eq!(repeated.tdi, manual.tdi);
        assert_eq!(repeated.tdo, manual.tdo);
        assert_eq!(repeated.states, manual.states);
    }

    #[test]
    fn repeat_zero_is_empty() {
        let mut cycle = JtagTemplate::starting_at(TapState::ShiftDr);
        cycle.shift(4, Tdi::AllOnes, false, false).unwrap();
        assert!(cycle.repeat(0).unwrap().is_empty());
    }

    #[test]
    fn loops_multiply_the_enclosed_body() {
        let mut looped = JtagTemplate::starting_at(TapState::ShiftDr);
        looped.begin_loop();
        looped.shift(4, Tdi::Variable, false, true).unwrap();
        looped.end_loop(3).unwrap();

        let mut body = JtagTemplate::starting_at(TapState::ShiftDr);
        body.shift(4, Tdi::Variable, false, true).unwrap();
        let expected = body.repeat(3).unwrap();

        assert_eq!(looped.tms, expected.tms);
        assert_eq!(looped.tdo, expected.tdo);
        assert_eq!(looped.variable_count(), 3);
    }

    #[test]
    fn unbalanced_end_loop_is_an_error() {
        let mut t = JtagTemplate::new();
        assert!(matches!(t.end_loop(2), Err(BuildError::UnbalancedLoop)));
    }

    #[test]
    fn passthrough_lanes() {
        let tms = bitvec![u8, Lsb0; 0; 100];
        let t = JtagTemplate::passthrough(&tms);
        assert_eq!(t.len(), 100);
        assert_eq!(t.tdi, vec![(64, Tdi::Variable), (36, Tdi::Variable)]);
        assert_eq!(t.tdo, vec![(0, 64), (64, 36)]);
        assert_eq!(t.tdi_bits(), 100);
    }
}
