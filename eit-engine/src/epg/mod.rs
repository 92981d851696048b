//! EPG reconciliation: section tracking, descriptor merging and the
//! reconciler itself.

pub mod descriptors;
pub mod handlers;
pub mod i18n;
pub mod reconciler;
pub mod section_syncer;
pub mod tables;

pub use handlers::{EpgHandler, EpgHandlers};
pub use reconciler::{EventReconciler, SectionOutcome, VALID_TIME};
pub use section_syncer::SectionSyncer;
pub use tables::{EitTables, EitTablesMap};
