//! EPG handler hooks.
//!
//! Handlers are consulted in registration order. Hooks returning `bool`
//! that claim an action stop the chain at the first handler returning true.
//! Every field the reconciler writes goes through a `set_*` hook; when no
//! handler claims it the value is stored as received.

use eit_protocol::EitEvent;

use crate::store::{Channel, Component, Event, Schedule};

/// Hook points into section reconciliation. Every method has a no-op default.
pub trait EpgHandler: Send + Sync {
    /// Skip every section for `channel`.
    fn ignore_channel(&self, _channel: &Channel) -> bool {
        false
    }

    /// Events of `channel` are stored elsewhere; the engine only hands
    /// transient events to [`handle_event`](Self::handle_event).
    fn handled_externally(&self, _channel: &Channel) -> bool {
        false
    }

    /// For externally handled channels: whether this event is new or changed.
    fn is_update(&self, _event_id: u16, _start_time: i64, _table_id: u8, _version: u8) -> bool {
        false
    }

    /// Take over the whole processing of one raw event.
    fn handle_eit_event(&self, _schedule: &mut Schedule, _event: &EitEvent, _table_id: u8, _version: u8) -> bool {
        false
    }

    /// Called before a section's events are merged. Returning false skips it.
    fn begin_segment_transfer(&self, _channel: &Channel) -> bool {
        true
    }

    /// Called after every section that passed `begin_segment_transfer`.
    fn end_segment_transfer(&self, _modified: bool) {}

    fn set_event_id(&self, _event: &mut Event, _event_id: u16) -> bool {
        false
    }

    fn set_start_time(&self, _event: &mut Event, _start_time: i64) -> bool {
        false
    }

    fn set_duration(&self, _event: &mut Event, _duration: i64) -> bool {
        false
    }

    fn set_title(&self, _event: &mut Event, _title: Option<&str>) -> bool {
        false
    }

    fn set_short_text(&self, _event: &mut Event, _short_text: Option<&str>) -> bool {
        false
    }

    fn set_description(&self, _event: &mut Event, _description: Option<&str>) -> bool {
        false
    }

    fn set_contents(&self, _event: &mut Event, _contents: &[u8]) -> bool {
        false
    }

    fn set_parental_rating(&self, _event: &mut Event, _rating: u8) -> bool {
        false
    }

    fn set_vps(&self, _event: &mut Event, _vps: i64) -> bool {
        false
    }

    fn set_components(&self, _event: &mut Event, _components: &[Component]) -> bool {
        false
    }

    /// Repair broadcaster mistakes in a merged event.
    fn fix_epg_bugs(&self, _event: &mut Event) -> bool {
        false
    }

    /// Observe a merged event.
    fn handle_event(&self, _event: &mut Event) -> bool {
        false
    }

    /// Order the events of a schedule after a section was merged.
    fn sort_schedule(&self, _schedule: &mut Schedule) -> bool {
        false
    }

    /// Remove events replaced by the segment `[start, end]` of table `table_id`.
    fn drop_outdated(
        &self,
        _schedule: &mut Schedule,
        _start: i64,
        _end: i64,
        _table_id: u8,
        _version: u8,
        _linger_limit: i64,
    ) -> bool {
        false
    }
}

/// Registered handlers.
#[derive(Default)]
pub struct EpgHandlers {
    handlers: Vec<Box<dyn EpgHandler>>,
}

impl EpgHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Box<dyn EpgHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn ignore_channel(&self, channel: &Channel) -> bool {
        self.handlers.iter().any(|h| h.ignore_channel(channel))
    }

    pub fn handled_externally(&self, channel: &Channel) -> bool {
        self.handlers.iter().any(|h| h.handled_externally(channel))
    }

    pub fn is_update(&self, event_id: u16, start_time: i64, table_id: u8, version: u8) -> bool {
        self.handlers
            .iter()
            .any(|h| h.is_update(event_id, start_time, table_id, version))
    }

    pub fn handle_eit_event(&self, schedule: &mut Schedule, event: &EitEvent, table_id: u8, version: u8) -> bool {
        self.handlers
            .iter()
            .any(|h| h.handle_eit_event(schedule, event, table_id, version))
    }

    pub fn begin_segment_transfer(&self, channel: &Channel) -> bool {
        self.handlers.iter().all(|h| h.begin_segment_transfer(channel))
    }

    pub fn end_segment_transfer(&self, modified: bool) {
        for h in &self.handlers {
            h.end_segment_transfer(modified);
        }
    }

    /// Id and start time of a stored event must be rekeyed in its schedule
    /// afterwards, see [`Schedule::rekey`].
    pub fn set_event_id(&self, event: &mut Event, event_id: u16) {
        if !self.handlers.iter().any(|h| h.set_event_id(event, event_id)) {
            event.event_id = event_id;
        }
    }

    pub fn set_start_time(&self, event: &mut Event, start_time: i64) {
        if !self.handlers.iter().any(|h| h.set_start_time(event, start_time)) {
            event.start_time = start_time;
        }
    }

    pub fn set_duration(&self, event: &mut Event, duration: i64) {
        if !self.handlers.iter().any(|h| h.set_duration(event, duration)) {
            event.duration = duration;
        }
    }

    pub fn set_title(&self, event: &mut Event, title: Option<String>) {
        if !self.handlers.iter().any(|h| h.set_title(event, title.as_deref())) {
            event.title = title;
        }
    }

    pub fn set_short_text(&self, event: &mut Event, short_text: Option<String>) {
        if !self.handlers.iter().any(|h| h.set_short_text(event, short_text.as_deref())) {
            event.short_text = short_text;
        }
    }

    pub fn set_description(&self, event: &mut Event, description: Option<String>) {
        if !self.handlers.iter().any(|h| h.set_description(event, description.as_deref())) {
            event.description = description;
        }
    }

    pub fn set_contents(&self, event: &mut Event, contents: &[u8]) {
        if !self.handlers.iter().any(|h| h.set_contents(event, contents)) {
            event.set_contents(contents);
        }
    }

    pub fn set_parental_rating(&self, event: &mut Event, rating: u8) {
        if !self.handlers.iter().any(|h| h.set_parental_rating(event, rating)) {
            event.parental_rating = rating;
        }
    }

    pub fn set_vps(&self, event: &mut Event, vps: i64) {
        if !self.handlers.iter().any(|h| h.set_vps(event, vps)) {
            event.vps = vps;
        }
    }

    pub fn set_components(&self, event: &mut Event, components: Vec<Component>) {
        if !self.handlers.iter().any(|h| h.set_components(event, &components)) {
            event.components = components;
        }
    }

    /// Run the first claiming handler, or the built-in fixer.
    pub fn fix_epg_bugs(&self, event: &mut Event) {
        if !self.handlers.iter().any(|h| h.fix_epg_bugs(event)) {
            fix_epg_bugs(event);
        }
    }

    pub fn handle_event(&self, event: &mut Event) {
        let _ = self.handlers.iter().any(|h| h.handle_event(event));
    }

    pub fn sort_schedule(&self, schedule: &mut Schedule) {
        if !self.handlers.iter().any(|h| h.sort_schedule(schedule)) {
            schedule.sort();
        }
    }

    /// Returns the number of events removed.
    pub fn drop_outdated(
        &self,
        schedule: &mut Schedule,
        start: i64,
        end: i64,
        table_id: u8,
        version: u8,
        linger_limit: i64,
    ) -> usize {
        let before = schedule.len();
        if self
            .handlers
            .iter()
            .any(|h| h.drop_outdated(schedule, start, end, table_id, version, linger_limit))
        {
            return before.saturating_sub(schedule.len());
        }
        schedule.drop_outdated(start, end, table_id, version, linger_limit)
    }
}

/// Built-in cleanup of event texts.
pub fn fix_epg_bugs(event: &mut Event) {
    fn tidy(text: &mut Option<String>) {
        if let Some(t) = text {
            let trimmed = t.trim();
            if trimmed.is_empty() {
                *text = None;
            } else if trimmed.len() != t.len() {
                *t = trimmed.to_string();
            }
        }
    }

    tidy(&mut event.title);
    tidy(&mut event.short_text);
    tidy(&mut event.description);

    if event.short_text.is_some() && event.short_text == event.title {
        event.short_text = None;
    }
}
