//! The IEEE 1149.1 TAP controller state graph.
//!
//! Sixteen states, each with exactly two successors selected by TMS. The
//! canonical shortest TMS sequence between every pair of states is computed
//! once, by breadth-first search, the first time a transition is requested.

use bitvec::prelude::*;
use once_cell::sync::Lazy;

/// A state of the TAP controller.
///
/// [`TapState::Unknown`] is the sentinel for a controller that has not been
/// reset yet; the only way out of it is the hard-coded reset sequence of
/// five TMS-high clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapState {
    Unknown,
    Reset,
    Idle,
    SelectDr,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIr,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

/// TMS sequence that reaches Test-Logic-Reset from any state, including
/// [`TapState::Unknown`].
pub const RESET_CLOCKS: usize = 5;

const STATES: [TapState; 16] = [
    TapState::Reset,
    TapState::Idle,
    TapState::SelectDr,
    TapState::CaptureDr,
    TapState::ShiftDr,
    TapState::Exit1Dr,
    TapState::PauseDr,
    TapState::Exit2Dr,
    TapState::UpdateDr,
    TapState::SelectIr,
    TapState::CaptureIr,
    TapState::ShiftIr,
    TapState::Exit1Ir,
    TapState::PauseIr,
    TapState::Exit2Ir,
    TapState::UpdateIr,
];

impl TapState {
    /// The successor state for one clock with the given TMS level.
    ///
    /// [`TapState::Unknown`] stays unknown; walking out of it is handled by
    /// [`transition`], which prepends the reset sequence.
    pub fn step(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (Unknown, _) => Unknown,
            (Reset, false) => Idle,
            (Reset, true) => Reset,
            (Idle, false) => Idle,
            (Idle, true) => SelectDr,
            (SelectDr, false) => CaptureDr,
            (SelectDr, true) => SelectIr,
            (CaptureDr, false) => ShiftDr,
            (CaptureDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (Exit1Dr, false) => PauseDr,
            (Exit1Dr, true) => UpdateDr,
            (PauseDr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (Exit2Dr, false) => ShiftDr,
            (Exit2Dr, true) => UpdateDr,
            (UpdateDr, false) => Idle,
            (UpdateDr, true) => SelectDr,
            (SelectIr, false) => CaptureIr,
            (SelectIr, true) => Reset,
            (CaptureIr, false) => ShiftIr,
            (CaptureIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (Exit1Ir, false) => PauseIr,
            (Exit1Ir, true) => UpdateIr,
            (PauseIr, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (Exit2Ir, false) => ShiftIr,
            (Exit2Ir, true) => UpdateIr,
            (UpdateIr, false) => Idle,
            (UpdateIr, true) => SelectDr,
        }
    }

    /// States a template may rest in between operations.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            TapState::Reset
                | TapState::Idle
                | TapState::PauseDr
                | TapState::PauseIr
                | TapState::ShiftDr
                | TapState::ShiftIr
        )
    }

    /// States in which each clock moves one bit through the selected register.
    pub fn is_shifting(self) -> bool {
        matches!(self, TapState::ShiftDr | TapState::ShiftIr)
    }

    /// The TMS sequence that stays in a shifting state for `n - 1` clocks
    /// and then, on the last clock, either stays or exits toward Exit1.
    /// `None` for non-shifting states.
    pub fn cycle(self, n: usize, exit: bool) -> Option<BitVec> {
        if !self.is_shifting() {
            return None;
        }
        let mut bits = BitVec::repeat(false, n);
        if exit && n > 0 {
            bits.set(n - 1, true);
        }
        Some(bits)
    }

    pub fn name(self) -> &'static str {
        use TapState::*;
        match self {
            Unknown => "unknown",
            Reset => "reset",
            Idle => "idle",
            SelectDr => "select_dr",
            CaptureDr => "capture_dr",
            ShiftDr => "shift_dr",
            Exit1Dr => "exit1_dr",
            PauseDr => "pause_dr",
            Exit2Dr => "exit2_dr",
            UpdateDr => "update_dr",
            SelectIr => "select_ir",
            CaptureIr => "capture_ir",
            ShiftIr => "shift_ir",
            Exit1Ir => "exit1_ir",
            PauseIr => "pause_ir",
            Exit2Ir => "exit2_ir",
            UpdateIr => "update_ir",
        }
    }

    /// Looks a state up by its lowercase name.
    pub fn by_name(name: &str) -> Option<TapState> {
        STATES
            .iter()
            .copied()
            .chain(std::iter::once(TapState::Unknown))
            .find(|s| s.name() == name)
    }

    fn index(self) -> Option<usize> {
        STATES.iter().position(|&s| s == self)
    }
}

impl std::fmt::Display for TapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `PATHS[from][to]` is the canonical shortest TMS sequence between two real
/// (non-unknown) states. BFS explores TMS=0 before TMS=1, so ties resolve the
/// same way on every run.
static PATHS: Lazy<Vec<Vec<BitVec>>> = Lazy::new(|| {
    STATES
        .iter()
        .map(|&from| {
            let mut paths: Vec<Option<BitVec>> = vec![None; STATES.len()];
            paths[from.index().unwrap()] = Some(BitVec::new());
            let mut queue = std::collections::VecDeque::from([from]);
            while let Some(state) = queue.pop_front() {
                let here = paths[state.index().unwrap()].clone().unwrap();
                for tms in [false, true] {
                    let succ = state.step(tms);
                    let slot = &mut paths[succ.index().unwrap()];
                    if slot.is_none() {
                        let mut path = here.clone();
                        path.push(tms);
                        *slot = Some(path);
                        queue.push_back(succ);
                    }
                }
            }
            paths.into_iter().map(Option::unwrap).collect()
        })
        .collect()
});

/// The canonical shortest TMS sequence from `from` to `to`.
///
/// From [`TapState::Unknown`] every path starts with the hard-coded reset
/// sequence (five ones), then a zero into Run-Test/Idle if the target lies
/// beyond Test-Logic-Reset. Returns `None` when `to` is the unknown sentinel.
pub fn path(from: TapState, to: TapState) -> Option<BitVec> {
    if to == TapState::Unknown {
        return (from == TapState::Unknown).then(BitVec::new);
    }
    if from == TapState::Unknown {
        let mut bits = BitVec::repeat(true, RESET_CLOCKS);
        bits.extend_from_bitslice(&path(TapState::Reset, to)?);
        return Some(bits);
    }
    Some(PATHS[from.index()?][to.index()?].clone())
}

/// The TMS sequence from `from` to `to` along with the per-clock states
/// traversed (one entry per clock, the state *after* that clock).
pub fn transition(from: TapState, to: TapState) -> Option<(BitVec, Vec<TapState>)> {
    let bits = path(from, to)?;
    let mut states = Vec::with_capacity(bits.len());
    if from == TapState::Unknown && to != TapState::Unknown {
        // The first four reset clocks leave the controller formally unknown;
        // the fifth is guaranteed to land in Test-Logic-Reset.
        states.extend([TapState::Unknown; 4]);
        states.push(TapState::Reset);
        let mut state = TapState::Reset;
        for tms in bits[RESET_CLOCKS..].iter().by_vals() {
            state = state.step(tms);
            states.push(state);
        }
    } else {
        let mut state = from;
        for tms in bits.iter().by_vals() {
            state = state.step(tms);
            states.push(state);
        }
    }
    debug_assert_eq!(states.last().copied().unwrap_or(from), to);
    Some((bits, states))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_has_two_successors() {
        for &state in &STATES {
            let s0 = state.step(false);
            let s1 = state.step(true);
            assert!(s0.index().is_some());
            assert!(s1.index().is_some());
        }
    }

    #[test]
    fn five_ones_reset_from_anywhere() {
        for &state in &STATES {
            let mut s = state;
            for _ in 0..RESET_CLOCKS {
                s = s.step(true);
            }
            assert_eq!(s, TapState::Reset, "from {state}");
        }
    }

    #[test]
    fn canonical_paths() {
        let p = path(TapState::Idle, TapState::ShiftDr).unwrap();
        assert_eq!(p, bitvec![1, 0, 0]);

        let p = path(TapState::Idle, TapState::ShiftIr).unwrap();
        assert_eq!(p, bitvec![1, 1, 0, 0]);

        let p = path(TapState::Exit1Dr, TapState::SelectDr).unwrap();
        assert_eq!(p, bitvec![1, 1]);

        // Staying put costs nothing.
        assert!(path(TapState::ShiftDr, TapState::ShiftDr).unwrap().is_empty());
    }

    #[test]
    fn paths_walk_the_graph() {
        for &from in &STATES {
            for &to in &STATES {
                let bits = path(from, to).unwrap();
                let mut state = from;
                for tms in bits.iter().by_vals() {
                    state = state.step(tms);
                }
                assert_eq!(state, to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn unknown_goes_through_reset() {
        let (bits, states) = transition(TapState::Unknown, TapState::Idle).unwrap();
        assert_eq!(bits, bitvec![1, 1, 1, 1, 1, 0]);
        assert_eq!(states.last(), Some(&TapState::Idle));
        assert_eq!(states[RESET_CLOCKS - 1], TapState::Reset);

        for &target in &STATES {
            if target.is_stable() {
                assert!(transition(TapState::Unknown, target).is_some());
            }
        }
    }

    #[test]
    fn cycle_strings_stay_or_exit() {
        let stay = TapState::ShiftDr.cycle(4, false).unwrap();
        assert_eq!(stay, bitvec![0, 0, 0, 0]);

        let exit = TapState::ShiftIr.cycle(4, true).unwrap();
        assert_eq!(exit, bitvec![0, 0, 0, 1]);

        assert!(TapState::Idle.cycle(4, false).is_none());
    }

    #[test]
    fn state_names_round_trip() {
        for &state in &STATES {
            assert_eq!(TapState::by_name(state.name()), Some(state));
        }
        assert_eq!(TapState::by_name("shift_dr"), Some(TapState::ShiftDr));
        assert_eq!(TapState::by_name("no_such_state"), None);
    }
}
