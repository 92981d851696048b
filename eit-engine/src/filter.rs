//! Section dispatcher for the EIT and TDT PIDs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eit_protocol::{decode_eit_section, decode_tdt_section, pid, table_id, SectionError};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::clock_sync::{ClockAction, ClockSync, SystemClock};
use crate::config::TimeConfig;
use crate::epg::{EventReconciler, SectionOutcome};

/// Frequencies closer than this many MHz are the same transponder.
const TRANSPONDER_TOLERANCE_MHZ: i64 = 4;

/// Whether two frequencies in MHz denote the same transponder.
pub fn is_transponder(a: u32, b: u32) -> bool {
    (a as i64 - b as i64).abs() < TRANSPONDER_TOLERANCE_MHZ
}

/// What the filter did with one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Filter switched off or inside the suppression window.
    Disabled,
    /// PID or table id not handled.
    Ignored,
    /// Section failed to decode.
    Invalid(SectionError),
    Eit(SectionOutcome),
    Time(ClockAction),
}

/// Process-wide window during which every filter drops its sections.
#[derive(Debug, Default)]
pub struct DisableWindow {
    until: Mutex<Option<i64>>,
}

impl DisableWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every section until `time` has passed.
    pub fn set(&self, time: i64) {
        *self.until.lock() = Some(time);
    }

    /// Whether sections arriving at `now` must be dropped. Clears the
    /// window once it has passed.
    pub fn is_active(&self, now: i64) -> bool {
        let mut until = self.until.lock();
        match *until {
            Some(t) if now > t => {
                *until = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Routes raw sections of one source and transponder.
pub struct EitFilter {
    source: u32,
    /// Transponder frequency in MHz.
    transponder: u32,
    time: TimeConfig,
    reconciler: Arc<EventReconciler>,
    clock_sync: Arc<ClockSync>,
    clock: Arc<dyn SystemClock>,
    active: AtomicBool,
    disable: Arc<DisableWindow>,
}

impl EitFilter {
    pub fn new(
        source: u32,
        transponder: u32,
        time: TimeConfig,
        reconciler: Arc<EventReconciler>,
        clock_sync: Arc<ClockSync>,
        clock: Arc<dyn SystemClock>,
        disable: Arc<DisableWindow>,
    ) -> Self {
        Self {
            source,
            transponder,
            time,
            reconciler,
            clock_sync,
            clock,
            active: AtomicBool::new(true),
            disable,
        }
    }

    pub fn reconciler(&self) -> &Arc<EventReconciler> {
        &self.reconciler
    }

    /// Switch the filter on or off. Either way section tracking starts over.
    pub fn set_status(&self, on: bool) {
        self.active.store(on, Ordering::SeqCst);
        self.reconciler.clear_tables();
        debug!("[Filter] Source {} filter {}", self.source, if on { "on" } else { "off" });
    }

    /// Drop every section, on this and all filters sharing the window,
    /// until `time` has passed.
    pub fn set_disable_until(&self, time: i64) {
        self.disable.set(time);
    }

    /// Handle one complete section received on `pid`.
    pub fn process(&self, pid: u16, data: &[u8]) -> FilterOutcome {
        if !self.active.load(Ordering::SeqCst) {
            return FilterOutcome::Disabled;
        }

        let now = self.clock.now();
        if self.disable.is_active(now) {
            return FilterOutcome::Disabled;
        }

        let Some(&tid) = data.first() else {
            return FilterOutcome::Ignored;
        };

        match pid {
            pid::EIT => {
                // 0x4F only causes trouble
                if !table_id::is_reconciled(tid) {
                    return FilterOutcome::Ignored;
                }
                match decode_eit_section(data) {
                    Ok(section) => FilterOutcome::Eit(self.reconciler.process(self.source, section, now)),
                    Err(e) => {
                        debug!("[Filter] Dropping EIT section 0x{:02X}: {}", tid, e);
                        FilterOutcome::Invalid(e)
                    }
                }
            }
            pid::TDT => {
                let trusted = self.time.set_system_time
                    && self.time.source == self.source
                    && self.time.transponder != 0
                    && is_transponder(self.transponder, self.time.transponder);
                if !trusted || tid != table_id::TDT {
                    trace!("[Filter] TDT from source {} not used", self.source);
                    return FilterOutcome::Ignored;
                }
                match decode_tdt_section(data) {
                    Ok(utc) => FilterOutcome::Time(self.clock_sync.process(utc)),
                    Err(e) => {
                        debug!("[Filter] Dropping TDT: {}", e);
                        FilterOutcome::Invalid(e)
                    }
                }
            }
            _ => FilterOutcome::Ignored,
        }
    }
}
