//! Abstract multi-pattern search engine interface.
//!
//! The compiler only sees these traits: it queries capabilities, adds
//! patterns with PMX cookies, and hands each engine an agent to call
//! back into during its offline compile pass. Engine algorithms live
//! behind the trait; two implementations ship with the crate.

pub mod ac;
pub mod rex;

use std::collections::HashMap;

use crate::compiler::tree::{MpseAgent, TreeSlot};
use crate::error::Result;
use crate::rules::pattern::Pmx;

/// Which engine slot of a group a matcher serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpseKind {
    Normal,
    Offload,
}

impl MpseKind {
    pub fn label(self) -> &'static str {
        match self {
            MpseKind::Normal => "normal",
            MpseKind::Offload => "offload",
        }
    }
}

/// Per-pattern flags handed to `add_pattern`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternDescriptor {
    pub no_case: bool,
    pub negated: bool,
    pub literal: bool,
    pub flags: u32,
}

/// One distinct pattern inside an engine: the bytes, every PMX that
/// inserted them, and the option tree grown from those PMXs during
/// compilation.
#[derive(Debug)]
pub struct PatternState {
    pub bytes: Vec<u8>,
    pub desc: PatternDescriptor,
    pub pmxs: Vec<Pmx>,
    pub tree: Option<TreeSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StateKey {
    bytes: Vec<u8>,
    no_case: bool,
    negated: bool,
}

/// Common pattern bookkeeping shared by engine implementations.
/// Identical inserts collapse into one state accumulating cookies.
#[derive(Debug, Default)]
pub struct PatternStore {
    states: Vec<PatternState>,
    index: HashMap<StateKey, usize>,
    neg_list: Vec<Pmx>,
}

impl PatternStore {
    pub fn add(&mut self, bytes: &[u8], desc: PatternDescriptor, pmx: Pmx) {
        let key = StateKey {
            bytes: bytes.to_vec(),
            no_case: desc.no_case,
            negated: desc.negated,
        };
        let idx = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                let i = self.states.len();
                self.index.insert(key, i);
                self.states.push(PatternState {
                    bytes: bytes.to_vec(),
                    desc,
                    pmxs: Vec::new(),
                    tree: None,
                });
                i
            }
        };
        self.states[idx].pmxs.push(pmx);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[PatternState] {
        &self.states
    }

    pub fn neg_list(&self) -> &[Pmx] {
        &self.neg_list
    }

    /// Grow and finalize the option tree of every pattern state, and
    /// collect negated-pattern cookies. Called from engine `compile`.
    pub fn build_trees(&mut self, agent: &MpseAgent) -> Result<()> {
        for state in &mut self.states {
            for pmx in &state.pmxs {
                agent.create_tree(Some(pmx), &mut state.tree)?;
            }
            agent.create_tree(None, &mut state.tree)?;

            if state.desc.negated {
                self.neg_list.extend(state.pmxs.iter().cloned());
            }
        }
        Ok(())
    }
}

/// A search engine instance owned by one port group slot.
pub trait Mpse: Send {
    fn add_pattern(&mut self, bytes: &[u8], desc: PatternDescriptor, pmx: Pmx);

    fn pattern_count(&self) -> usize;

    /// Engine-specific optimization toggle.
    fn set_opt(&mut self, _enable: bool) {}

    fn print_info(&self) {}

    /// Offline compilation. Invokes `agent.create_tree` once per PMX
    /// per distinct pattern and once more with `None` per pattern to
    /// finalize that pattern's tree.
    fn compile(&mut self, agent: &MpseAgent) -> Result<()>;

    fn states(&self) -> &[PatternState];

    fn neg_list(&self) -> &[Pmx];
}

/// Engine factory plus capability queries.
pub trait MpseApi: Send + Sync {
    fn name(&self) -> &'static str;

    /// False forces the selector to pick literal contents only.
    fn regex_capable(&self) -> bool;

    /// True permits compiling this engine's instances on a thread pool.
    fn parallel_compiles(&self) -> bool;

    fn create(&self) -> Result<Box<dyn Mpse>>;

    fn start_search_engine(&self) {}

    fn setup_search_engine(&self) {}

    fn print_summary(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::options::OptionInterner;
    use crate::rules::pattern::PatternMatchData;

    fn pmx(rule: u32, interner: &mut OptionInterner, pattern: &[u8]) -> Pmx {
        let opt = interner.content(PatternMatchData::literal(pattern));
        let pmd = opt.payload.as_content().unwrap().clone();
        Pmx::new(rule, opt, pmd)
    }

    #[test]
    fn test_store_dedupes_identical_patterns() {
        let mut interner = OptionInterner::new();
        let mut store = PatternStore::default();
        let desc = PatternDescriptor {
            literal: true,
            ..Default::default()
        };

        store.add(b"abc", desc, pmx(0, &mut interner, b"abc"));
        store.add(b"abc", desc, pmx(1, &mut interner, b"abc"));
        store.add(b"def", desc, pmx(2, &mut interner, b"def"));

        assert_eq!(store.len(), 2);
        assert_eq!(store.states()[0].pmxs.len(), 2);
    }

    #[test]
    fn test_store_splits_on_flags() {
        let mut interner = OptionInterner::new();
        let mut store = PatternStore::default();

        let plain = PatternDescriptor {
            literal: true,
            ..Default::default()
        };
        let negated = PatternDescriptor {
            literal: true,
            negated: true,
            ..Default::default()
        };

        store.add(b"abc", plain, pmx(0, &mut interner, b"abc"));
        store.add(b"abc", negated, pmx(1, &mut interner, b"abc"));

        assert_eq!(store.len(), 2);
    }
}
