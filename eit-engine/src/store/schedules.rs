//! Schedule store: per-channel event lists.

use std::collections::{BTreeMap, HashMap};

use eit_protocol::{table_id, RunningStatus};
use serde::Serialize;

use super::channels::ChannelId;

/// Maximum number of content codes kept per event.
pub const MAX_EVENT_CONTENTS: usize = 4;

/// Table id of an event that no table has written yet.
pub const TABLE_ID_NONE: u8 = 0xFF;

/// One elementary stream component announced for an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Component {
    /// Stream content, with the extension in the upper nibble for HEVC/AC-4.
    pub stream: u8,
    pub component_type: u8,
    pub language: String,
    pub description: String,
}

/// A single EPG event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_id: u16,
    /// UNIX seconds, negative for NVOD reference events.
    pub start_time: i64,
    /// Seconds.
    pub duration: i64,
    pub title: Option<String>,
    pub short_text: Option<String>,
    pub description: Option<String>,
    /// Content codes, `level1 << 4 | level2`.
    pub contents: Vec<u8>,
    /// Minimum age, 0 when unrated.
    pub parental_rating: u8,
    /// PDC/VPS time, 0 when absent.
    pub vps: i64,
    pub components: Vec<Component>,
    /// Table id of the section that last wrote this event.
    pub table_id: u8,
    /// Version of the section that last wrote this event.
    pub version: u8,
    pub running_status: RunningStatus,
    /// Seen in the current present/following cycle.
    #[serde(skip)]
    pub seen: bool,
    /// A timer is attached. Only affects logging.
    #[serde(skip)]
    pub has_timer: bool,
}

impl Event {
    pub fn new(event_id: u16) -> Self {
        Self {
            event_id,
            start_time: 0,
            duration: 0,
            title: None,
            short_text: None,
            description: None,
            contents: Vec::new(),
            parental_rating: 0,
            vps: 0,
            components: Vec::new(),
            table_id: TABLE_ID_NONE,
            version: 0xFF,
            running_status: RunningStatus::Undefined,
            seen: false,
            has_timer: false,
        }
    }

    pub fn end_time(&self) -> i64 {
        self.start_time + self.duration
    }

    /// Store up to [`MAX_EVENT_CONTENTS`] content codes.
    pub fn set_contents(&mut self, contents: &[u8]) {
        self.contents = contents.iter().take(MAX_EVENT_CONTENTS).copied().collect();
    }

    /// Short human-readable description for log lines.
    pub fn describe(&self) -> String {
        let start = chrono::DateTime::from_timestamp(self.start_time, 0)
            .filter(|_| self.start_time >= 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "NVOD".to_string());
        format!("{} {} '{}'", self.event_id, start, self.title.as_deref().unwrap_or(""))
    }
}

/// Events of one channel, indexed by event id and by start time.
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub channel_id: ChannelId,
    events: Vec<Event>,
    #[serde(skip)]
    by_id: HashMap<u16, usize>,
    #[serde(skip)]
    by_time: HashMap<i64, usize>,
    /// Set once any 0x5X section has been seen for this schedule.
    on_actual_tp: bool,
    present_seen: bool,
    has_running: bool,
}

impl Schedule {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            events: Vec::new(),
            by_id: HashMap::new(),
            by_time: HashMap::new(),
            on_actual_tp: false,
            present_seen: false,
            has_running: false,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event(&self, index: usize) -> &Event {
        &self.events[index]
    }

    pub fn event_mut(&mut self, index: usize) -> &mut Event {
        &mut self.events[index]
    }

    pub fn index_by_id(&self, event_id: u16) -> Option<usize> {
        self.by_id.get(&event_id).copied()
    }

    pub fn index_by_time(&self, start_time: i64) -> Option<usize> {
        self.by_time.get(&start_time).copied()
    }

    pub fn get_event_by_id(&self, event_id: u16) -> Option<&Event> {
        self.index_by_id(event_id).map(|i| &self.events[i])
    }

    /// Append an event and index it. Returns its index.
    pub fn add_event(&mut self, event: Event) -> usize {
        let index = self.events.len();
        self.by_id.insert(event.event_id, index);
        self.by_time.insert(event.start_time, index);
        self.events.push(event);
        index
    }

    /// Change id and times of an event, keeping both indices in step.
    pub fn update_event_identity(&mut self, index: usize, event_id: u16, start_time: i64, duration: i64) {
        let event = &mut self.events[index];
        let (old_id, old_start) = (event.event_id, event.start_time);
        event.event_id = event_id;
        event.start_time = start_time;
        event.duration = duration;
        self.rekey(index, old_id, old_start);
    }

    /// Move the index entries of the event at `index` after its id or start
    /// time was written directly.
    pub fn rekey(&mut self, index: usize, old_id: u16, old_start: i64) {
        let (event_id, start_time) = (self.events[index].event_id, self.events[index].start_time);
        if event_id != old_id {
            if self.by_id.get(&old_id) == Some(&index) {
                self.by_id.remove(&old_id);
            }
            self.by_id.insert(event_id, index);
        }
        if start_time != old_start {
            if self.by_time.get(&old_start) == Some(&index) {
                self.by_time.remove(&old_start);
            }
            self.by_time.insert(start_time, index);
        }
    }

    /// Record the table id of an incoming section.
    ///
    /// Returns true once any 0x5X table has been seen for this schedule.
    pub fn on_actual_tp(&mut self, tid: u8) -> bool {
        if table_id::is_schedule_actual(tid) {
            self.on_actual_tp = true;
        }
        self.on_actual_tp
    }

    pub fn is_on_actual_tp(&self) -> bool {
        self.on_actual_tp
    }

    /// Apply a running status to the event at `index`.
    ///
    /// Earlier events still marked pausing or running are set to not
    /// running when the new status is pausing or running. `index` is `None`
    /// for an event that is not stored in this schedule. Returns true if
    /// any stored status changed.
    pub fn set_running_status(&mut self, index: Option<usize>, start_time: i64, status: RunningStatus) -> bool {
        let mut changed = false;
        for (i, event) in self.events.iter_mut().enumerate() {
            if Some(i) == index {
                if event.running_status > RunningStatus::NotRunning || status > RunningStatus::NotRunning {
                    changed |= event.running_status != status;
                    event.running_status = status;
                }
            } else if status >= RunningStatus::Pausing
                && event.start_time < start_time
                && event.running_status >= RunningStatus::Pausing
            {
                event.running_status = RunningStatus::NotRunning;
                changed = true;
            }
        }
        self.update_has_running();
        changed
    }

    /// Mark every running or pausing event as not running.
    pub fn clear_running_status(&mut self) -> bool {
        let mut changed = false;
        for event in &mut self.events {
            if event.running_status >= RunningStatus::Pausing {
                event.running_status = RunningStatus::NotRunning;
                changed = true;
            }
        }
        self.has_running = false;
        changed
    }

    fn update_has_running(&mut self) {
        self.has_running = self.events.iter().any(|e| e.running_status >= RunningStatus::Pausing);
    }

    pub fn has_running(&self) -> bool {
        self.has_running
    }

    /// The event currently running or pausing.
    pub fn present_event(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.running_status >= RunningStatus::Pausing)
    }

    pub fn set_present_seen(&mut self) {
        self.present_seen = true;
    }

    pub fn present_seen(&self) -> bool {
        self.present_seen
    }

    /// Clear the seen flag of every event.
    pub fn reset_seen(&mut self) {
        for event in &mut self.events {
            event.seen = false;
        }
    }

    /// Sort events by start time.
    pub fn sort(&mut self) {
        self.events.sort_by_key(|e| e.start_time);
        self.reindex();
    }

    /// Drop events replaced by a freshly received segment or long gone.
    ///
    /// With a valid window `[start, end]` an event is dropped when it
    /// overlaps the window and comes from a table with a higher id (or the
    /// same table with another version), or when it lies outside the window
    /// and ended before `linger_limit`. NVOD reference events are kept.
    /// Returns the number of events dropped.
    pub fn drop_outdated(&mut self, start: i64, end: i64, tid: u8, version: u8, linger_limit: i64) -> usize {
        if start <= 0 || end <= 0 {
            return 0;
        }

        let before = self.events.len();
        self.events.retain(|e| {
            if e.start_time < 0 {
                return true;
            }
            let overlaps = e.end_time() > start && e.start_time < end;
            if overlaps {
                let event_tid = e.table_id.max(table_id::PRESENT_FOLLOWING);
                !(event_tid > tid || (event_tid == tid && e.version != version))
            } else {
                e.end_time() >= linger_limit
            }
        });

        let dropped = before - self.events.len();
        if dropped > 0 {
            self.reindex();
            self.update_has_running();
        }
        dropped
    }

    fn reindex(&mut self) {
        self.by_id.clear();
        self.by_time.clear();
        for (i, event) in self.events.iter().enumerate() {
            self.by_id.insert(event.event_id, i);
            self.by_time.insert(event.start_time, i);
        }
    }
}

/// Schedules of all channels.
#[derive(Debug, Default)]
pub struct Schedules {
    schedules: BTreeMap<ChannelId, Schedule>,
}

impl Schedules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ChannelId) -> Option<&Schedule> {
        self.schedules.get(id)
    }

    pub fn get_or_create(&mut self, id: ChannelId) -> &mut Schedule {
        self.schedules.entry(id).or_insert_with(|| Schedule::new(id))
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Schedule> {
        self.schedules.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;
    const LINGER: i64 = 3 * 3600;

    fn event(id: u16, start: i64, duration: i64, tid: u8, version: u8) -> Event {
        let mut e = Event::new(id);
        e.start_time = start;
        e.duration = duration;
        e.table_id = tid;
        e.version = version;
        e
    }

    fn schedule() -> Schedule {
        Schedule::new(ChannelId::new(1, 1, 1, 1))
    }

    #[test]
    fn test_indices_follow_identity_changes() {
        let mut s = schedule();
        let i = s.add_event(event(10, NOW, 600, 0x50, 1));
        assert_eq!(s.index_by_id(10), Some(i));
        assert_eq!(s.index_by_time(NOW), Some(i));

        s.update_event_identity(i, 11, NOW + 60, 540);
        assert_eq!(s.index_by_id(10), None);
        assert_eq!(s.index_by_id(11), Some(i));
        assert_eq!(s.index_by_time(NOW), None);
        assert_eq!(s.index_by_time(NOW + 60), Some(i));
        assert_eq!(s.event(i).duration, 540);
    }

    #[test]
    fn test_rekey_after_direct_write() {
        let mut s = schedule();
        let i = s.add_event(event(10, NOW, 600, 0x50, 1));
        s.event_mut(i).start_time = NOW + 300;
        s.rekey(i, 10, NOW);
        assert_eq!(s.index_by_id(10), Some(i));
        assert_eq!(s.index_by_time(NOW), None);
        assert_eq!(s.index_by_time(NOW + 300), Some(i));
    }

    #[test]
    fn test_sort_reindexes() {
        let mut s = schedule();
        s.add_event(event(2, NOW + 600, 600, 0x50, 1));
        s.add_event(event(1, NOW, 600, 0x50, 1));
        s.sort();
        assert_eq!(s.event(0).event_id, 1);
        assert_eq!(s.index_by_id(2), Some(1));
        assert_eq!(s.index_by_time(NOW), Some(0));
    }

    #[test]
    fn test_on_actual_tp_latches() {
        let mut s = schedule();
        assert!(!s.on_actual_tp(0x60));
        assert!(s.on_actual_tp(0x51));
        assert!(s.on_actual_tp(0x60));
        assert!(s.on_actual_tp(0x4E));
    }

    #[test]
    fn test_set_running_status_stops_earlier_events() {
        let mut s = schedule();
        let a = s.add_event(event(1, NOW - 600, 600, 0x4E, 1));
        let b = s.add_event(event(2, NOW, 600, 0x4E, 1));

        assert!(s.set_running_status(Some(a), NOW - 600, RunningStatus::Running));
        assert!(s.has_running());

        assert!(s.set_running_status(Some(b), NOW, RunningStatus::Running));
        assert_eq!(s.event(a).running_status, RunningStatus::NotRunning);
        assert_eq!(s.event(b).running_status, RunningStatus::Running);
        assert_eq!(s.present_event().map(|e| e.event_id), Some(2));

        // Same status again is not a change
        assert!(!s.set_running_status(Some(b), NOW, RunningStatus::Running));
    }

    #[test]
    fn test_not_running_on_undefined_event_is_ignored() {
        let mut s = schedule();
        let a = s.add_event(event(1, NOW, 600, 0x4E, 1));
        assert!(!s.set_running_status(Some(a), NOW, RunningStatus::NotRunning));
        assert_eq!(s.event(a).running_status, RunningStatus::Undefined);
    }

    #[test]
    fn test_clear_running_status() {
        let mut s = schedule();
        let a = s.add_event(event(1, NOW, 600, 0x4E, 1));
        s.set_running_status(Some(a), NOW, RunningStatus::Pausing);
        assert!(s.clear_running_status());
        assert!(!s.has_running());
        assert_eq!(s.event(a).running_status, RunningStatus::NotRunning);
        assert!(!s.clear_running_status());
    }

    #[test]
    fn test_drop_outdated_linger_boundary() {
        let mut s = schedule();
        let limit = NOW - LINGER;
        s.add_event(event(1, limit - 700, 600, 0x50, 1)); // ends at limit - 100
        s.add_event(event(2, limit - 599, 600, 0x50, 1)); // ends at limit + 1
        s.add_event(event(3, NOW, 600, 0x50, 1));
        s.sort();

        let dropped = s.drop_outdated(NOW, NOW + 600, 0x50, 1, limit);
        assert_eq!(dropped, 1);
        assert!(s.get_event_by_id(1).is_none());
        assert!(s.get_event_by_id(2).is_some());
        assert!(s.get_event_by_id(3).is_some());
    }

    #[test]
    fn test_drop_outdated_superseded_in_window() {
        let mut s = schedule();
        let limit = NOW - LINGER;
        s.add_event(event(1, NOW, 600, 0x60, 3)); // higher table id
        s.add_event(event(2, NOW + 600, 600, 0x50, 2)); // old version
        s.add_event(event(3, NOW + 1200, 600, 0x50, 3)); // current
        s.add_event(event(4, NOW + 600, 600, 0x4E, 9)); // present/following
        s.add_event(event(5, NOW + 7200, 600, 0x60, 3)); // outside window
        s.sort();

        let dropped = s.drop_outdated(NOW, NOW + 1800, 0x50, 3, limit);
        assert_eq!(dropped, 2);
        let ids: Vec<u16> = s.events().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![4, 3, 5]);
    }

    #[test]
    fn test_drop_outdated_keeps_nvod_and_needs_window() {
        let mut s = schedule();
        s.add_event(event(1, -1, 0, 0x50, 1));
        s.add_event(event(2, 1000, 60, 0x50, 1));
        assert_eq!(s.drop_outdated(0, 0, 0x50, 1, NOW), 0);
        assert_eq!(s.drop_outdated(NOW, NOW + 60, 0x50, 1, NOW), 1);
        assert_eq!(s.events()[0].event_id, 1);
    }
}
