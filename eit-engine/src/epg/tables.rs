//! Per-service tracking of the whole EIT table hierarchy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::section_syncer::SectionSyncer;

/// 0x4E, 0x50..=0x5F, 0x60..=0x6F.
pub const NUM_EIT_TABLES: usize = 33;

/// Slot of a table id in the hierarchy.
///
/// Ids below 0x4E share the present/following slot; ids above 0x6F are
/// never passed in.
pub fn table_index(tid: u8) -> usize {
    match tid {
        0x50..=0x5F => 1 + (tid - 0x50) as usize,
        0x60..=0x6F => 17 + (tid - 0x60) as usize,
        _ => 0,
    }
}

/// Section trackers for every table of one service.
#[derive(Debug, Clone)]
pub struct EitTables {
    syncers: [SectionSyncer; NUM_EIT_TABLES],
    complete: bool,
    /// Start of the present event.
    table_start: i64,
    /// End of the following event.
    table_end: i64,
}

impl Default for EitTables {
    fn default() -> Self {
        Self::new()
    }
}

impl EitTables {
    pub fn new() -> Self {
        Self {
            syncers: std::array::from_fn(|_| SectionSyncer::new()),
            complete: false,
            table_start: 0,
            table_end: 0,
        }
    }

    /// Returns true if the section still needs processing.
    pub fn check(&mut self, tid: u8, version: u8, section_number: u8) -> bool {
        self.syncers[table_index(tid)].check(version, section_number)
    }

    /// Record a processed section. Returns true if its table is complete.
    ///
    /// When the table completed, the whole hierarchy up to `last_table_id`
    /// is checked and [`is_complete`](Self::is_complete) updated.
    pub fn processed(
        &mut self,
        tid: u8,
        last_table_id: u8,
        section_number: u8,
        last_section_number: u8,
        segment_last_section_number: u8,
    ) -> bool {
        self.complete = false;
        let table_complete = self.syncers[table_index(tid)].processed(
            section_number,
            last_section_number,
            segment_last_section_number,
        );
        if table_complete {
            let last = table_index(last_table_id).max(table_index(tid));
            self.complete = self.syncers[..=last].iter().all(|s| s.is_complete());
        }
        table_complete
    }

    /// Whether every table up to the last table id is complete.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn set_table_start(&mut self, start: i64) {
        self.table_start = start;
    }

    pub fn set_table_end(&mut self, end: i64) {
        self.table_end = end;
    }

    pub fn table_start(&self) -> i64 {
        self.table_start
    }

    pub fn table_end(&self) -> i64 {
        self.table_end
    }
}

/// Trackers of all services, keyed by service id.
#[derive(Debug, Default)]
pub struct EitTablesMap {
    tables: RwLock<HashMap<u16, Arc<Mutex<EitTables>>>>,
}

impl EitTablesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&self, service_id: u16) -> Arc<Mutex<EitTables>> {
        if let Some(t) = self.tables.read().get(&service_id) {
            return Arc::clone(t);
        }
        Arc::clone(self.tables.write().entry(service_id).or_default())
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_index() {
        assert_eq!(table_index(0x4E), 0);
        assert_eq!(table_index(0x42), 0);
        assert_eq!(table_index(0x50), 1);
        assert_eq!(table_index(0x5F), 16);
        assert_eq!(table_index(0x60), 17);
        assert_eq!(table_index(0x6F), 32);
    }

    #[test]
    fn test_hierarchy_complete_only_when_all_tables_done() {
        let mut t = EitTables::new();

        // 0x50 complete, 0x51 outstanding
        assert!(t.check(0x50, 1, 0));
        assert!(t.processed(0x50, 0x51, 0, 0, 0));
        assert!(!t.is_complete());

        assert!(t.check(0x51, 1, 0));
        assert!(!t.processed(0x51, 0x51, 0, 1, 0));
        assert!(!t.is_complete());

        assert!(t.check(0x51, 1, 1));
        assert!(t.processed(0x51, 0x51, 1, 1, 1));
        // 0x4E slot is part of the hierarchy and still missing
        assert!(!t.is_complete());

        assert!(t.check(0x4E, 2, 0));
        assert!(t.processed(0x4E, 0x51, 0, 0, 0));
        assert!(t.is_complete());
    }

    #[test]
    fn test_version_bump_resets_single_table() {
        let mut t = EitTables::new();
        t.check(0x4E, 1, 0);
        assert!(t.processed(0x4E, 0x4E, 0, 0, 0));
        assert!(t.is_complete());
        assert!(!t.check(0x4E, 1, 0));

        assert!(t.check(0x4E, 2, 0));
        assert!(t.processed(0x4E, 0x4E, 0, 0, 0));
    }

    #[test]
    fn test_map_shares_entries() {
        let map = EitTablesMap::new();
        let a = map.get_or_insert(7);
        a.lock().set_table_start(42);
        assert_eq!(map.get_or_insert(7).lock().table_start(), 42);
        assert_eq!(map.len(), 1);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.get_or_insert(7).lock().table_start(), 0);
    }
}
