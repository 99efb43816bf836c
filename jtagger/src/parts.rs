//! The parts database.
//!
//! Two flat text files loaded at startup: `partindex.txt` maps 32-bit
//! IDCODE patterns (over `{0,1,x}`) to an IR-capture pattern and a part
//! name; `manufacturers.txt` maps the 11-bit JEDEC manufacturer code to a
//! name. IDCODE wildcards are fully expanded into the lookup table at load
//! time, so a lookup is a single map query. Unknown parts are not an error;
//! they come back labelled `(unknown part)`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Expanding a pattern with more wildcards than this would blow up the
/// table.
pub const MAX_WILDCARDS: usize = 17;

const UNKNOWN_PART: &str = "(unknown part)";
const UNKNOWN_MANUFACTURER: &str = "(unknown manufacturer)";

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed line {line} in {what}: {text:?}")]
    BadLine { what: &'static str, line: usize, text: String },

    #[error("pattern {pattern:?} has more than {MAX_WILDCARDS} wildcards")]
    TooManyWildcards { pattern: String },
}

/// One identified (or unidentified) device on the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// Raw IDCODE; zero for a device seen only in BYPASS.
    pub idcode: u32,
    pub name: String,
    pub manufacturer: String,
    /// IR-capture pattern over `{0,1,x}` from the database, or the literal
    /// capture once discovery has observed it. Empty when unknown.
    pub ir_capture: String,
    /// Instruction register width; zero until discovery fills it in.
    pub ir_len: usize,
}

impl PartInfo {
    /// Every `(length, value)` pair the capture pattern allows.
    pub fn possible_ir(&self) -> Vec<(usize, u64)> {
        if self.ir_capture.is_empty() {
            return Vec::new();
        }
        let len = self.ir_capture.len();
        match expand_pattern(&self.ir_capture) {
            Ok(values) => values.into_iter().map(|v| (len, v)).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (ir_capture = {:?})",
            self.manufacturer, self.name, self.ir_capture
        )
    }
}

/// Expands a binary pattern with `x` wildcards into every matching value.
pub fn expand_pattern(pattern: &str) -> Result<Vec<u64>, DatabaseError> {
    let mut base = 0u64;
    let mut x_positions = Vec::new();
    if pattern.is_empty() || pattern.len() > 64 {
        return Err(DatabaseError::BadLine { what: "pattern", line: 0, text: pattern.into() });
    }
    for (i, c) in pattern.chars().enumerate() {
        // Leftmost character is the most significant bit.
        let bit = pattern.len() - 1 - i;
        match c {
            '0' => {}
            '1' => base |= 1 << bit,
            'x' | 'X' => x_positions.push(bit),
            _ => {
                return Err(DatabaseError::BadLine {
                    what: "pattern",
                    line: 0,
                    text: pattern.into(),
                })
            }
        }
    }
    if x_positions.len() > MAX_WILDCARDS {
        return Err(DatabaseError::TooManyWildcards { pattern: pattern.into() });
    }
    let mut out = Vec::with_capacity(1 << x_positions.len());
    for combo in 0u64..(1 << x_positions.len()) {
        let mut value = base;
        for (j, &bit) in x_positions.iter().enumerate() {
            if combo >> j & 1 != 0 {
                value |= 1 << bit;
            }
        }
        out.push(value);
    }
    Ok(out)
}

/// The in-memory database: IDCODE to part, manufacturer code to name.
#[derive(Debug, Clone, Default)]
pub struct PartDatabase {
    parts: HashMap<u32, (String, String)>,
    manufacturers: HashMap<u16, String>,
}

impl PartDatabase {
    /// The database shipped with the crate.
    pub fn builtin() -> PartDatabase {
        PartDatabase::from_strs(
            include_str!("../data/partindex.txt"),
            include_str!("../data/manufacturers.txt"),
        )
        .expect("built-in parts database is well formed")
    }

    /// Loads from the two files, `JTAGID_FILE` style overrides included.
    pub fn load(parts_path: &Path, mfg_path: &Path) -> Result<PartDatabase, DatabaseError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path)
                .map_err(|source| DatabaseError::Io { path: path.into(), source })
        };
        PartDatabase::from_strs(&read(parts_path)?, &read(mfg_path)?)
    }

    pub fn from_strs(parts: &str, manufacturers: &str) -> Result<PartDatabase, DatabaseError> {
        let mut db = PartDatabase::default();
        db.add_parts(parts)?;
        db.add_manufacturers(manufacturers)?;
        Ok(db)
    }

    /// Parses `<idcode pattern> <ir_capture pattern> <name...>` lines,
    /// expanding IDCODE wildcards into the table.
    pub fn add_parts(&mut self, text: &str) -> Result<(), DatabaseError> {
        for (lineno, line) in data_lines(text) {
            let bad = || DatabaseError::BadLine {
                what: "partindex",
                line: lineno,
                text: line.to_string(),
            };
            let mut fields = line.split_whitespace();
            let idcode = fields.next().ok_or_else(bad)?;
            let ir_capture = fields.next().ok_or_else(bad)?;
            let name = fields.collect::<Vec<_>>().join(" ");
            if name.is_empty() || idcode.len() != 32 {
                return Err(bad());
            }
            for value in expand_pattern(idcode)? {
                self.parts.insert(value as u32, (ir_capture.to_string(), name.clone()));
            }
        }
        Ok(())
    }

    /// Parses `<11-bit code> <manufacturer name...>` lines.
    pub fn add_manufacturers(&mut self, text: &str) -> Result<(), DatabaseError> {
        for (lineno, line) in data_lines(text) {
            let bad = || DatabaseError::BadLine {
                what: "manufacturers",
                line: lineno,
                text: line.to_string(),
            };
            let mut fields = line.split_whitespace();
            let code = fields.next().ok_or_else(bad)?;
            let code = u16::from_str_radix(code, 2).map_err(|_| bad())?;
            let name = fields.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                return Err(bad());
            }
            self.manufacturers.insert(code, name);
        }
        Ok(())
    }

    /// Never fails: unknown IDCODEs produce a placeholder record.
    pub fn lookup(&self, idcode: u32) -> PartInfo {
        let (ir_capture, name) = match self.parts.get(&idcode) {
            Some((capture, name)) => (capture.clone(), name.clone()),
            None => (String::new(), UNKNOWN_PART.to_string()),
        };
        let ir_len = ir_capture.len();
        PartInfo {
            idcode,
            name,
            manufacturer: self.manufacturer_name(idcode),
            ir_capture,
            ir_len,
        }
    }

    /// Bits 1..=11 of the IDCODE are the JEDEC manufacturer code.
    pub fn manufacturer_name(&self, idcode: u32) -> String {
        let code = (idcode >> 1) as u16 & 0x7FF;
        self.manufacturers
            .get(&code)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_MANUFACTURER.to_string())
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }
}

/// Yields `(line number, content)` with comments and blanks stripped.
fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.split('#').next().unwrap_or("").trim()))
        .filter(|(_, line)| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, value: u64) -> bool {
        pattern.chars().rev().enumerate().all(|(bit, c)| match c {
            'x' | 'X' => true,
            '1' => value >> bit & 1 == 1,
            '0' => value >> bit & 1 == 0,
            _ => false,
        })
    }

    #[test]
    fn expansion_is_sound_and_complete() {
        let pattern = "x10x1";
        let values = expand_pattern(pattern).unwrap();
        assert_eq!(values.len(), 4);
        for &v in &values {
            assert!(matches(pattern, v), "{v:#b} does not match {pattern}");
        }
        // Nothing outside the expansion matches.
        for v in 0..(1u64 << pattern.len()) {
            assert_eq!(values.contains(&v), matches(pattern, v), "{v:#b}");
        }
    }

    #[test]
    fn expansion_without_wildcards_is_the_literal() {
        assert_eq!(expand_pattern("110101").unwrap(), vec![0b110101]);
    }

    #[test]
    fn too_many_wildcards_are_rejected() {
        let pattern: String = "x".repeat(MAX_WILDCARDS + 1);
        assert!(matches!(
            expand_pattern(&pattern),
            Err(DatabaseError::TooManyWildcards { .. })
        ));
    }

    #[test]
    fn builtin_database_loads() {
        let db = PartDatabase::builtin();
        assert!(db.part_count() > 0);

        // XC7A200T, every version nibble.
        let part = db.lookup(0x1363_1093);
        assert_eq!(part.name, "XC7A200T");
        assert_eq!(part.manufacturer, "Xilinx");
        assert_eq!(part.ir_len, 6);
        assert!(part.possible_ir().contains(&(6, 0b110101)));
        let part = db.lookup(0x4363_1093);
        assert_eq!(part.name, "XC7A200T");
    }

    #[test]
    fn unknown_parts_are_not_fatal() {
        let db = PartDatabase::builtin();
        let part = db.lookup(0xDEAD_BEEF);
        assert_eq!(part.name, "(unknown part)");
        assert!(part.possible_ir().is_empty());
        assert_eq!(part.ir_len, 0);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let parts = "\n# header comment\n\
                     xxxx0011011000110001000010010011 xx0101 Part A # trailing\n\
                     \n";
        let mfgs = "00001001001 Maker Inc # comment\n";
        let db = PartDatabase::from_strs(parts, mfgs).unwrap();
        let part = db.lookup(0x1363_1093);
        assert_eq!(part.name, "Part A");
        assert_eq!(part.manufacturer, "Maker Inc");
    }

    #[test]
    fn malformed_lines_are_reported_with_position() {
        let err = PartDatabase::from_strs("0101 xx01 TooShort\n", "").unwrap_err();
        assert!(matches!(err, DatabaseError::BadLine { what: "partindex", line: 1, .. }));

        let err = PartDatabase::from_strs("", "notbinary Someone\n").unwrap_err();
        assert!(matches!(err, DatabaseError::BadLine { what: "manufacturers", line: 1, .. }));
    }

    #[test]
    fn manufacturer_code_is_bits_1_to_11() {
        let db = PartDatabase::builtin();
        // Xilinx is JEDEC 0x49: IDCODE bits 1..=11.
        assert_eq!(db.manufacturer_name(0x049 << 1 | 1), "Xilinx");
        assert_eq!(db.manufacturer_name(0x7FF << 1), "(unknown manufacturer)");
    }
}
