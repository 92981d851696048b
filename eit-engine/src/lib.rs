//! EIT reconciliation engine.
//!
//! Decoded EIT sections are merged into per-channel schedules held in
//! lock-protected stores; TDT sections can keep the system clock in step
//! with the broadcast.

pub mod clock_sync;
pub mod config;
pub mod epg;
pub mod filter;
pub mod logging;
pub mod store;
pub mod ts_reader;

pub use clock_sync::{ClockAction, ClockSync, OsClock, SystemClock};
pub use config::{load_config, ConfigError, ConfigFile, EngineConfig};
pub use filter::{DisableWindow, EitFilter, FilterOutcome};
pub use ts_reader::{replay, ReaderStats, TsReader};
