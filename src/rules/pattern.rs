//! Pattern match data: the content-option payload handed to the search
//! engines, and the PMX cookie that ties an engine hit back to its rule.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::options::DetectionOption;
use super::RuleId;

/// Pattern match category. Selects which buffer an engine scans and
/// which engine slot of a port group a pattern lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PmType {
    /// Raw packet payload
    Pkt,
    /// Normalized URI
    Uri,
    /// Normalized headers
    Header,
    /// Normalized message body
    Body,
    /// Key / cookie buffer
    Key,
    /// Extracted file data
    File,
}

impl PmType {
    pub const COUNT: usize = 6;

    pub const ALL: [PmType; PmType::COUNT] = [
        PmType::Pkt,
        PmType::Uri,
        PmType::Header,
        PmType::Body,
        PmType::Key,
        PmType::File,
    ];

    /// Index into per-group engine arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            PmType::Pkt => 0,
            PmType::Uri => 1,
            PmType::Header => 2,
            PmType::Body => 3,
            PmType::Key => 4,
            PmType::File => 5,
        }
    }

    /// Non-raw buffers are only searchable in service groups; a port
    /// group has no normalized buffers to scan.
    #[inline]
    pub fn is_raw(self) -> bool {
        matches!(self, PmType::Pkt)
    }
}

impl Default for PmType {
    fn default() -> Self {
        PmType::Pkt
    }
}

impl std::fmt::Display for PmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PmType::Pkt => "packet",
            PmType::Uri => "uri",
            PmType::Header => "header",
            PmType::Body => "body",
            PmType::Key => "key",
            PmType::File => "file",
        };
        write!(f, "{}", s)
    }
}

/// One content option's bytes, flags, and placement metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PatternMatchData {
    /// Pattern bytes to match
    pub pattern: Vec<u8>,
    /// Buffer category
    pub pm_type: PmType,
    /// User-requested fast pattern slice start
    pub fp_offset: usize,
    /// User-requested fast pattern slice length (0 = to end)
    pub fp_length: usize,
    /// Explicitly marked `fast_pattern` by the rule author
    pub is_fast_pattern: bool,
    /// Negated match (!content)
    pub is_negated: bool,
    /// Case insensitive matching
    pub is_no_case: bool,
    /// Plain literal bytes (false for regex-shaped contents)
    pub is_literal: bool,
    /// Engine-specific flags passed through to `add_pattern`
    pub mpse_flags: u32,
    /// Absolute offset from start of buffer
    pub offset: Option<u32>,
    /// Maximum depth to search
    pub depth: Option<u32>,
    /// Relative distance from last match
    pub distance: Option<i32>,
    /// Must match within N bytes of last match
    pub within: Option<u32>,
}

impl PatternMatchData {
    pub fn literal(pattern: &[u8]) -> Self {
        Self {
            pattern: pattern.to_vec(),
            is_literal: true,
            ..Default::default()
        }
    }

    /// True when the content carries any positional constraint and so
    /// must be re-evaluated after an engine hit.
    pub fn has_constraints(&self) -> bool {
        self.offset.is_some()
            || self.depth.is_some()
            || self.distance.is_some()
            || self.within.is_some()
    }
}

/// Cookie attached to every pattern inserted into a search engine. When
/// the engine fires it hands the PMX back and the runtime enters the
/// detection option tree rooted at the matched pattern.
#[derive(Clone)]
pub struct Pmx {
    pub rule: RuleId,
    pub option: Arc<DetectionOption>,
    pmd: Arc<PatternMatchData>,
}

impl Pmx {
    pub fn new(rule: RuleId, option: Arc<DetectionOption>, pmd: Arc<PatternMatchData>) -> Self {
        Self { rule, option, pmd }
    }

    /// The content payload this cookie was created from.
    pub fn pmd(&self) -> &PatternMatchData {
        &self.pmd
    }
}

impl std::fmt::Debug for Pmx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pmx")
            .field("rule", &self.rule)
            .field("option", &self.option.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pm_type_index_roundtrip() {
        for (i, t) in PmType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }

    #[test]
    fn test_constraints() {
        let mut pmd = PatternMatchData::literal(b"abc");
        assert!(!pmd.has_constraints());
        pmd.depth = Some(10);
        assert!(pmd.has_constraints());
    }
}
