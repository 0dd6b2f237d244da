//! # Pipeline Stages
//!
//! One module per stage. Each stage is an [`EventHandler`](crate::bus::EventHandler)
//! driver parameterized by a per-integration trait:
//!
//! | Stage     | Consumes      | Publishes     | Customization point |
//! |-----------|---------------|---------------|---------------------|
//! | adapter   | `*.sync.*`      | `*.fetched.*`   | [`adapter::Adapter`] |
//! | processor | `*.fetched.*`   | `*.processed.*` | [`Normalizer`](crate::normalization::Normalizer) |
//! | sweeper   | `*.processed.*` | (none)          | (none) |
//! | linker    | `*.processed.*` | `*.linked.*`    | [`linker::Linker`] |
//! | analyzer  | `*.linked.*`    | alert sink      | [`analyzer::Analyzer`] |

pub mod adapter;
pub mod analyzer;
pub mod linker;
pub mod processor;
pub mod sweeper;

pub use adapter::{Adapter, AdapterDriver, ConnectorAdapter};
pub use analyzer::{
    AlertSink, AnalysisReport, Analyzer, AnalyzerDriver, MemoryAlertSink, StaleIdentityAnalyzer,
    TracingAlertSink, UnlicensedFirewallAnalyzer,
};
pub use linker::{
    EntityGraph, KeyMatchLinker, LinkOutcome, Linker, LinkerDriver, RelationshipCandidate,
};
pub use processor::ProcessorDriver;
pub use sweeper::{SweepOutcome, SweeperDriver};
