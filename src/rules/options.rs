//! Detection options: the residual checks a rule runs after its fast
//! pattern fires.
//!
//! Options are interned so that two rules written with the same option
//! share one `OptionId`. Prefix sharing in the detection option trees
//! compares ids, never addresses.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use regex::bytes::Regex;

use super::pattern::PatternMatchData;

/// Stable interned identity of a detection option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptionId(pub u64);

/// Option discriminant carried on tree nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOptionKind {
    Content,
    PcreRegex,
    ByteTest,
    ByteJump,
    IsDataAt,
    Dsize,
    Flowbits,
    Leaf,
}

impl std::fmt::Display for RuleOptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuleOptionKind::Content => "content",
            RuleOptionKind::PcreRegex => "pcre",
            RuleOptionKind::ByteTest => "byte_test",
            RuleOptionKind::ByteJump => "byte_jump",
            RuleOptionKind::IsDataAt => "isdataat",
            RuleOptionKind::Dsize => "dsize",
            RuleOptionKind::Flowbits => "flowbits",
            RuleOptionKind::Leaf => "leaf",
        };
        write!(f, "{}", s)
    }
}

/// PCRE option payload. The expression is compiled once at intern time.
#[derive(Debug, Clone)]
pub struct PcreData {
    pub pattern: String,
    pub flags: String,
    pub negated: bool,
    pub relative: bool,
    re: Regex,
}

impl PcreData {
    pub fn compile(pattern: &str, flags: &str, negated: bool) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        if flags.contains('i') {
            expr.push_str("(?i)");
        }
        if flags.contains('s') {
            expr.push_str("(?s)");
        }
        if flags.contains('m') {
            expr.push_str("(?m)");
        }
        expr.push_str(pattern);

        Ok(Self {
            pattern: pattern.to_string(),
            flags: flags.to_string(),
            negated,
            relative: flags.contains('R'),
            re: Regex::new(&expr)?,
        })
    }

    pub fn regex(&self) -> &Regex {
        &self.re
    }
}

// Identity is the source expression, not the compiled automaton.
impl PartialEq for PcreData {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
            && self.flags == other.flags
            && self.negated == other.negated
    }
}

impl Eq for PcreData {}

impl Hash for PcreData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
        self.flags.hash(state);
        self.negated.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteTestOp {
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessOrEqual,
    GreaterOrEqual,
    BitwiseAnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ByteTestData {
    pub num_bytes: u8,
    pub operator: ByteTestOp,
    pub value: u64,
    pub offset: i32,
    pub relative: bool,
    pub endian: Endian,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ByteJumpData {
    pub num_bytes: u8,
    pub offset: i32,
    pub relative: bool,
    pub multiplier: u32,
    pub post_offset: i32,
    pub endian: Endian,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsDataAtData {
    pub position: u32,
    pub relative: bool,
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SizeMatch {
    pub operator: CompareOp,
    pub value: u32,
    pub value2: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowbitsOp {
    Set(String),
    Unset(String),
    Toggle(String),
    IsSet(String),
    IsNotSet(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OptionPayload {
    Content(Arc<PatternMatchData>),
    Pcre(PcreData),
    ByteTest(ByteTestData),
    ByteJump(ByteJumpData),
    IsDataAt(IsDataAtData),
    Dsize(SizeMatch),
    Flowbits(FlowbitsOp),
    Leaf,
}

impl OptionPayload {
    pub fn kind(&self) -> RuleOptionKind {
        match self {
            OptionPayload::Content(_) => RuleOptionKind::Content,
            OptionPayload::Pcre(_) => RuleOptionKind::PcreRegex,
            OptionPayload::ByteTest(_) => RuleOptionKind::ByteTest,
            OptionPayload::ByteJump(_) => RuleOptionKind::ByteJump,
            OptionPayload::IsDataAt(_) => RuleOptionKind::IsDataAt,
            OptionPayload::Dsize(_) => RuleOptionKind::Dsize,
            OptionPayload::Flowbits(_) => RuleOptionKind::Flowbits,
            OptionPayload::Leaf => RuleOptionKind::Leaf,
        }
    }

    pub fn as_content(&self) -> Option<&Arc<PatternMatchData>> {
        match self {
            OptionPayload::Content(pmd) => Some(pmd),
            _ => None,
        }
    }
}

/// Evaluation state threaded through a detection option chain.
pub struct EvalContext<'a> {
    pub buffer: &'a [u8],
    pub cursor: usize,
    pub flowbits: Option<&'a HashSet<String>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            cursor: 0,
            flowbits: None,
        }
    }
}

pub type EvalFn = fn(&DetectionOption, &mut EvalContext) -> bool;

/// A single interned detection option.
#[derive(Debug, Clone)]
pub struct DetectionOption {
    pub id: OptionId,
    pub kind: RuleOptionKind,
    pub is_relative: bool,
    pub payload: OptionPayload,
}

impl DetectionOption {
    /// The check run against a buffer when this option is reached
    /// during tree evaluation.
    pub fn evaluator(&self) -> EvalFn {
        match self.kind {
            RuleOptionKind::Content => eval_content,
            RuleOptionKind::PcreRegex => eval_pcre,
            RuleOptionKind::ByteTest => eval_byte_test,
            RuleOptionKind::ByteJump => eval_byte_jump,
            RuleOptionKind::IsDataAt => eval_is_data_at,
            RuleOptionKind::Dsize => eval_dsize,
            RuleOptionKind::Flowbits => eval_flowbits,
            RuleOptionKind::Leaf => eval_leaf,
        }
    }
}

/// Hash-consing interner. Two calls with the same payload and relative
/// flag return the same `Arc` and therefore the same `OptionId`.
#[derive(Default)]
pub struct OptionInterner {
    next: u64,
    map: HashMap<(OptionPayload, bool), Arc<DetectionOption>>,
}

impl OptionInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, payload: OptionPayload, is_relative: bool) -> Arc<DetectionOption> {
        if let Some(opt) = self.map.get(&(payload.clone(), is_relative)) {
            return opt.clone();
        }
        let id = OptionId(self.next);
        self.next += 1;
        let opt = Arc::new(DetectionOption {
            id,
            kind: payload.kind(),
            is_relative,
            payload: payload.clone(),
        });
        self.map.insert((payload, is_relative), opt.clone());
        opt
    }

    /// Intern a content option. Relativity follows the presence of
    /// distance/within constraints.
    pub fn content(&mut self, pmd: PatternMatchData) -> Arc<DetectionOption> {
        let relative = pmd.distance.is_some() || pmd.within.is_some();
        self.intern(OptionPayload::Content(Arc::new(pmd)), relative)
    }

    pub fn pcre(&mut self, data: PcreData) -> Arc<DetectionOption> {
        let relative = data.relative;
        self.intern(OptionPayload::Pcre(data), relative)
    }

    pub fn byte_test(&mut self, data: ByteTestData) -> Arc<DetectionOption> {
        let relative = data.relative;
        self.intern(OptionPayload::ByteTest(data), relative)
    }

    pub fn flowbits(&mut self, op: FlowbitsOp) -> Arc<DetectionOption> {
        self.intern(OptionPayload::Flowbits(op), false)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn eval_content(opt: &DetectionOption, ctx: &mut EvalContext) -> bool {
    let pmd = match opt.payload.as_content() {
        Some(pmd) => pmd,
        None => return false,
    };

    match find_content(pmd, ctx.buffer, ctx.cursor) {
        Some(pos) => {
            if pmd.is_negated {
                return false;
            }
            ctx.cursor = pos + pmd.pattern.len();
            true
        }
        None => pmd.is_negated,
    }
}

/// Locate a content pattern honoring its positional constraints.
/// `start` is the end of the previous match in the chain.
pub fn find_content(pmd: &PatternMatchData, buffer: &[u8], start: usize) -> Option<usize> {
    let search_start = if let Some(offset) = pmd.offset {
        offset as usize
    } else if let Some(distance) = pmd.distance {
        if distance >= 0 {
            start + distance as usize
        } else {
            start.saturating_sub((-distance) as usize)
        }
    } else {
        start
    };

    let search_end = if let Some(depth) = pmd.depth {
        (search_start + depth as usize).min(buffer.len())
    } else if let Some(within) = pmd.within {
        (start + within as usize).min(buffer.len())
    } else {
        buffer.len()
    };

    if search_start >= buffer.len() || search_end <= search_start {
        return None;
    }

    let range = &buffer[search_start..search_end];
    if pmd.pattern.len() > range.len() {
        return None;
    }

    let found = if pmd.is_no_case {
        find_nocase(range, &pmd.pattern)
    } else {
        find_bytes(range, &pmd.pattern)
    };

    found.map(|i| search_start + i)
}

/// Fast case-sensitive byte pattern search.
#[inline]
fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }

    let first = needle[0];
    let mut pos = 0;

    while pos <= haystack.len() - needle.len() {
        if let Some(offset) = haystack[pos..].iter().position(|&b| b == first) {
            let start = pos + offset;
            if start + needle.len() <= haystack.len()
                && &haystack[start..start + needle.len()] == needle
            {
                return Some(start);
            }
            pos = start + 1;
        } else {
            break;
        }
    }
    None
}

/// Case-insensitive search without allocation.
#[inline]
fn find_nocase(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }

    let first_lower = needle[0].to_ascii_lowercase();
    let first_upper = needle[0].to_ascii_uppercase();
    let mut pos = 0;

    while pos <= haystack.len() - needle.len() {
        let found = haystack[pos..]
            .iter()
            .position(|&b| b == first_lower || b == first_upper);

        if let Some(offset) = found {
            let start = pos + offset;
            if start + needle.len() <= haystack.len() {
                let matches = haystack[start..start + needle.len()]
                    .iter()
                    .zip(needle.iter())
                    .all(|(&h, &n)| h.to_ascii_lowercase() == n.to_ascii_lowercase());
                if matches {
                    return Some(start);
                }
            }
            pos = start + 1;
        } else {
            break;
        }
    }
    None
}

fn eval_pcre(opt: &DetectionOption, ctx: &mut EvalContext) -> bool {
    let data = match &opt.payload {
        OptionPayload::Pcre(d) => d,
        _ => return false,
    };

    let haystack = if data.relative {
        &ctx.buffer[ctx.cursor.min(ctx.buffer.len())..]
    } else {
        ctx.buffer
    };
    let base = if data.relative { ctx.cursor } else { 0 };

    match data.regex().find(haystack) {
        Some(m) => {
            if data.negated {
                return false;
            }
            ctx.cursor = base + m.end();
            true
        }
        None => data.negated,
    }
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn read_le(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn extract_value(buffer: &[u8], at: usize, num_bytes: u8, endian: Endian) -> Option<u64> {
    let n = num_bytes as usize;
    if n == 0 || n > 8 || at + n > buffer.len() {
        return None;
    }
    let bytes = &buffer[at..at + n];
    Some(match endian {
        Endian::Big => read_be(bytes),
        Endian::Little => read_le(bytes),
    })
}

fn resolve_offset(base: usize, offset: i32, relative: bool) -> Option<usize> {
    let from = if relative { base as i64 } else { 0 };
    let at = from + offset as i64;
    if at < 0 {
        None
    } else {
        Some(at as usize)
    }
}

fn eval_byte_test(opt: &DetectionOption, ctx: &mut EvalContext) -> bool {
    let data = match &opt.payload {
        OptionPayload::ByteTest(d) => d,
        _ => return false,
    };

    let at = match resolve_offset(ctx.cursor, data.offset, data.relative) {
        Some(at) => at,
        None => return false,
    };
    let value = match extract_value(ctx.buffer, at, data.num_bytes, data.endian) {
        Some(v) => v,
        None => return false,
    };

    match data.operator {
        ByteTestOp::Equal => value == data.value,
        ByteTestOp::NotEqual => value != data.value,
        ByteTestOp::LessThan => value < data.value,
        ByteTestOp::GreaterThan => value > data.value,
        ByteTestOp::LessOrEqual => value <= data.value,
        ByteTestOp::GreaterOrEqual => value >= data.value,
        ByteTestOp::BitwiseAnd => value & data.value != 0,
    }
}

fn eval_byte_jump(opt: &DetectionOption, ctx: &mut EvalContext) -> bool {
    let data = match &opt.payload {
        OptionPayload::ByteJump(d) => d,
        _ => return false,
    };

    let at = match resolve_offset(ctx.cursor, data.offset, data.relative) {
        Some(at) => at,
        None => return false,
    };
    let value = match extract_value(ctx.buffer, at, data.num_bytes, data.endian) {
        Some(v) => v,
        None => return false,
    };

    let mult = data.multiplier.max(1) as i64;
    let target =
        at as i64 + data.num_bytes as i64 + value as i64 * mult + data.post_offset as i64;

    if target < 0 || target as usize > ctx.buffer.len() {
        return false;
    }
    ctx.cursor = target as usize;
    true
}

fn eval_is_data_at(opt: &DetectionOption, ctx: &mut EvalContext) -> bool {
    let data = match &opt.payload {
        OptionPayload::IsDataAt(d) => d,
        _ => return false,
    };

    let at = if data.relative {
        ctx.cursor + data.position as usize
    } else {
        data.position as usize
    };
    let present = at < ctx.buffer.len();
    present != data.negated
}

fn eval_dsize(opt: &DetectionOption, ctx: &mut EvalContext) -> bool {
    let data = match &opt.payload {
        OptionPayload::Dsize(d) => d,
        _ => return false,
    };
    let len = ctx.buffer.len() as u32;

    match data.operator {
        CompareOp::Equal => len == data.value,
        CompareOp::NotEqual => len != data.value,
        CompareOp::LessThan => len < data.value,
        CompareOp::GreaterThan => len > data.value,
        CompareOp::Range => data
            .value2
            .map(|hi| len > data.value && len < hi)
            .unwrap_or(false),
    }
}

fn eval_flowbits(opt: &DetectionOption, ctx: &mut EvalContext) -> bool {
    let op = match &opt.payload {
        OptionPayload::Flowbits(op) => op,
        _ => return false,
    };

    match op {
        FlowbitsOp::IsSet(name) => ctx
            .flowbits
            .map(|bits| bits.contains(name))
            .unwrap_or(false),
        FlowbitsOp::IsNotSet(name) => ctx
            .flowbits
            .map(|bits| !bits.contains(name))
            .unwrap_or(true),
        // State mutations are applied by the caller after the chain matches.
        FlowbitsOp::Set(_) | FlowbitsOp::Unset(_) | FlowbitsOp::Toggle(_) => true,
    }
}

fn eval_leaf(_opt: &DetectionOption, _ctx: &mut EvalContext) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_opt(interner: &mut OptionInterner, pattern: &[u8]) -> Arc<DetectionOption> {
        interner.content(PatternMatchData::literal(pattern))
    }

    #[test]
    fn test_interner_shares_identical_options() {
        let mut interner = OptionInterner::new();
        let a = content_opt(&mut interner, b"GET");
        let b = content_opt(&mut interner, b"GET");
        let c = content_opt(&mut interner, b"POST");

        assert_eq!(a.id, b.id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_content_eval() {
        let mut interner = OptionInterner::new();
        let opt = content_opt(&mut interner, b"test");

        let mut ctx = EvalContext::new(b"this is a test");
        assert!(eval_content(&opt, &mut ctx));
        assert_eq!(ctx.cursor, 14);

        let mut ctx = EvalContext::new(b"no match here");
        assert!(!eval_content(&opt, &mut ctx));
    }

    #[test]
    fn test_content_eval_offset() {
        let mut interner = OptionInterner::new();
        let mut pmd = PatternMatchData::literal(b"test");
        pmd.offset = Some(10);
        let opt = interner.content(pmd);

        let mut ctx = EvalContext::new(b"this is a test");
        assert!(eval_content(&opt, &mut ctx));

        let mut ctx = EvalContext::new(b"test at start");
        assert!(!eval_content(&opt, &mut ctx));
    }

    #[test]
    fn test_content_eval_nocase() {
        let mut interner = OptionInterner::new();
        let mut pmd = PatternMatchData::literal(b"TEST");
        pmd.is_no_case = true;
        let opt = interner.content(pmd);

        let mut ctx = EvalContext::new(b"this is a test");
        assert!(eval_content(&opt, &mut ctx));
    }

    #[test]
    fn test_negated_content_eval() {
        let mut interner = OptionInterner::new();
        let mut pmd = PatternMatchData::literal(b"XYZ");
        pmd.is_negated = true;
        let opt = interner.content(pmd);

        let mut ctx = EvalContext::new(b"clean payload");
        assert!(eval_content(&opt, &mut ctx));

        let mut ctx = EvalContext::new(b"has XYZ inside");
        assert!(!eval_content(&opt, &mut ctx));
    }

    #[test]
    fn test_pcre_eval() {
        let mut interner = OptionInterner::new();
        let data = PcreData::compile(r"GET\s+/\S+", "", false).unwrap();
        let opt = interner.pcre(data);

        let mut ctx = EvalContext::new(b"GET /index.html HTTP/1.1");
        assert!(eval_pcre(&opt, &mut ctx));
        assert!(ctx.cursor > 0);
    }

    #[test]
    fn test_byte_test_eval() {
        let mut interner = OptionInterner::new();
        let opt = interner.byte_test(ByteTestData {
            num_bytes: 2,
            operator: ByteTestOp::Equal,
            value: 0x0102,
            offset: 1,
            relative: false,
            endian: Endian::Big,
        });

        let mut ctx = EvalContext::new(&[0x00, 0x01, 0x02, 0x03]);
        assert!(eval_byte_test(&opt, &mut ctx));
    }

    #[test]
    fn test_flowbits_eval() {
        let mut interner = OptionInterner::new();
        let opt = interner.flowbits(FlowbitsOp::IsSet("seen.login".into()));

        let mut bits = HashSet::new();
        bits.insert("seen.login".to_string());

        let mut ctx = EvalContext::new(b"");
        ctx.flowbits = Some(&bits);
        assert!(eval_flowbits(&opt, &mut ctx));

        let empty = HashSet::new();
        ctx.flowbits = Some(&empty);
        assert!(!eval_flowbits(&opt, &mut ctx));
    }
}
