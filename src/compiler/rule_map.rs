//! Port-indexed rule maps.
//!
//! The runtime's first lookup: dense per-port arrays pointing at the
//! compiled group for that port, per protocol and direction, plus the
//! generic group for any-any rules.

use std::sync::Arc;

use super::groups::PortGroup;
use crate::ports::ProtoTables;

pub const PORT_SLOTS: usize = 65536;

/// Dense port to group maps for one protocol.
pub struct PortRuleMap {
    src: Vec<Option<Arc<PortGroup>>>,
    dst: Vec<Option<Arc<PortGroup>>>,
    any: Option<Arc<PortGroup>>,
    pub num_src_rules: u32,
    pub num_dst_rules: u32,
    pub num_generic_rules: u32,
    pub num_src_groups: u32,
    pub num_dst_groups: u32,
}

impl Default for PortRuleMap {
    fn default() -> Self {
        Self {
            src: vec![None; PORT_SLOTS],
            dst: vec![None; PORT_SLOTS],
            any: None,
            num_src_rules: 0,
            num_dst_rules: 0,
            num_generic_rules: 0,
            num_src_groups: 0,
            num_dst_groups: 0,
        }
    }
}

impl PortRuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the compiled groups out of a protocol's port tables.
    /// Every port contained in a grouped object points at that object's
    /// group.
    pub(crate) fn build(tables: &mut ProtoTables) -> Self {
        let mut prm = PortRuleMap::new();

        for po in tables.src.iter_mut() {
            if let Some(group) = po.group.take() {
                let group = Arc::new(group);
                prm.num_src_rules += po.rules.len() as u32;
                prm.num_src_groups += 1;
                for port in po.ports.iter() {
                    prm.src[port as usize] = Some(group.clone());
                }
            }
        }

        for po in tables.dst.iter_mut() {
            if let Some(group) = po.group.take() {
                let group = Arc::new(group);
                prm.num_dst_rules += po.rules.len() as u32;
                prm.num_dst_groups += 1;
                for port in po.ports.iter() {
                    prm.dst[port as usize] = Some(group.clone());
                }
            }
        }

        prm.num_generic_rules = tables.any.rules.len() as u32;
        prm.any = tables.any.group.take().map(Arc::new);

        prm
    }

    pub fn src_group(&self, port: u16) -> Option<&Arc<PortGroup>> {
        self.src[port as usize].as_ref()
    }

    pub fn dst_group(&self, port: u16) -> Option<&Arc<PortGroup>> {
        self.dst[port as usize].as_ref()
    }

    pub fn any_group(&self) -> Option<&Arc<PortGroup>> {
        self.any.as_ref()
    }
}

impl std::fmt::Debug for PortRuleMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRuleMap")
            .field("num_src_rules", &self.num_src_rules)
            .field("num_dst_rules", &self.num_dst_rules)
            .field("num_generic_rules", &self.num_generic_rules)
            .field("num_src_groups", &self.num_src_groups)
            .field("num_dst_groups", &self.num_dst_groups)
            .field("any", &self.any.is_some())
            .finish()
    }
}
