//! Fast-pattern detection compiler for a signature-based NIDS.
//!
//! Compiles a parsed rule corpus into the data structures the packet
//! inspection path consults:
//!
//! - multi-pattern search engines partitioned by protocol, direction,
//!   port object, service, and pattern match category
//! - detection option trees rooted at each inserted pattern, with
//!   shared option prefixes merged across rules
//! - dense port-to-group and service-to-group index maps
//!
//! Also provides the HPACK dynamic header table used by the HTTP/2
//! inspector, with RFC 7541 size accounting.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fpdetect::{build, FastPatternConfig, ProtoRef, RulePortTables};
//! use fpdetect::mpse::ac::AcApi;
//!
//! let fp = FastPatternConfig::new(Arc::new(AcApi));
//! let proto_ref = ProtoRef::new();
//!
//! // rules come from the parser
//! let tables = RulePortTables::from_rules(&rules);
//! let snapshot = build(&fp, &proto_ref, rules, tables)?;
//!
//! let group = snapshot.prm_tcp.dst_group(80);
//! ```

pub mod compiler;
pub mod config;
pub mod error;
pub mod hpack;
pub mod mpse;
pub mod ports;
pub mod rules;

pub use compiler::groups::PortGroup;
pub use compiler::rule_map::PortRuleMap;
pub use compiler::service::{ProtoRef, ServiceGroupMap, ServiceOrdinalMap};
pub use compiler::{build, CompileCounts, DetectionSnapshot};
pub use config::{FastPatternConfig, FastPatternOptions};
pub use error::{CompileError, Result};
pub use hpack::{Field, FlowAllocations, HpackDynamicTable, HpackTableEntry};
pub use ports::{PortObject, PortSet, PortTable, RulePortTables};
pub use rules::{Direction, PortSpec, Protocol, Rule, RuleId, RuleSet, SigId};
