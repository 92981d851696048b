//! Merging EIT sections into the channel and schedule stores.
//!
//! Broadcasters send the same event in several tables with different ids,
//! versions and cadences. The rules applied here:
//!
//! - Table 0x4F is never seen here; the filter drops it.
//! - Once a schedule has seen a 0x5X table, 0x6X tables are ignored for it.
//! - Events are looked up by event id for 0x4E and 0x5X, by start time for
//!   0x6X.
//! - An event last written by 0x4E is never overwritten by another table.
//! - Only 0x4E carries a trusted running status.

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use eit_protocol::{table_id, EitSection, RunningStatus};
use log::{debug, info, trace};

use super::descriptors::EventDescriptors;
use super::handlers::EpgHandlers;
use super::tables::EitTablesMap;
use crate::config::EpgConfig;
use crate::store::{Channel, ChannelId, Channels, Event, Schedule, Schedules, StateLock};

/// Times before this are taken as an unset clock (two years after the epoch).
pub const VALID_TIME: i64 = 31_536_000 * 2;

/// What happened to one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionOutcome {
    /// Section already processed for this version.
    Duplicate,
    /// Local clock is not plausible yet.
    ClockNotSet,
    /// A store lock could not be acquired in time.
    StoreBusy,
    /// Channel unknown and not creatable, or ignored by a handler.
    ChannelRejected,
    /// 0x6X section for a schedule that already gets 0x5X.
    OtherTpIgnored,
    /// A handler declined the segment transfer.
    TransferDeclined,
    /// The section went through the merge.
    Processed {
        modified: bool,
        channels_modified: bool,
        pruned: usize,
    },
}

/// The event a raw EIT event is merged into.
enum Target {
    Stored(usize),
    /// Events of externally handled channels are built and handed out only.
    Transient(Box<Event>),
}

impl Target {
    fn get<'a>(&'a mut self, schedule: &'a mut Schedule) -> &'a mut Event {
        match self {
            Target::Stored(i) => schedule.event_mut(*i),
            Target::Transient(e) => e,
        }
    }

    fn index(&self) -> Option<usize> {
        match self {
            Target::Stored(i) => Some(*i),
            Target::Transient(_) => None,
        }
    }
}

/// Work around broadcasters sending "not running" where it makes no sense.
///
/// A present event already pausing stays pausing; a following event
/// falls back to undefined.
pub fn override_running_status(new: RunningStatus, current: RunningStatus, section_number: u8) -> RunningStatus {
    if new != current && new == RunningStatus::NotRunning {
        if section_number == 0 {
            if current == RunningStatus::Pausing {
                return RunningStatus::Pausing;
            }
        } else {
            return RunningStatus::Undefined;
        }
    }
    new
}

/// Name carried in the private data of a Premiere linkage.
fn link_name(private_data: &[u8]) -> String {
    let end = private_data.iter().position(|&b| b == 0).unwrap_or(private_data.len());
    String::from_utf8_lossy(&private_data[..end]).trim().to_string()
}

/// Merges decoded EIT sections into the stores.
pub struct EventReconciler {
    config: EpgConfig,
    channels: Arc<StateLock<Channels>>,
    schedules: Arc<StateLock<Schedules>>,
    handlers: Arc<EpgHandlers>,
    tables: EitTablesMap,
}

impl EventReconciler {
    pub fn new(
        config: EpgConfig,
        channels: Arc<StateLock<Channels>>,
        schedules: Arc<StateLock<Schedules>>,
        handlers: Arc<EpgHandlers>,
    ) -> Self {
        Self {
            config,
            channels,
            schedules,
            handlers,
            tables: EitTablesMap::new(),
        }
    }

    pub fn channels(&self) -> &Arc<StateLock<Channels>> {
        &self.channels
    }

    pub fn schedules(&self) -> &Arc<StateLock<Schedules>> {
        &self.schedules
    }

    /// Forget all section tracking, so every table is processed again.
    pub fn clear_tables(&self) {
        self.tables.clear();
    }

    /// Merge one section, taking `now` in UNIX seconds and local time.
    pub fn process(&self, source: u32, section: EitSection, now: i64) -> SectionOutcome {
        match Local.timestamp_opt(now, 0).earliest() {
            Some(local) => self.process_at(source, section, &local),
            None => SectionOutcome::ClockNotSet,
        }
    }

    /// Merge one section. `now` also provides the time zone for PDC labels.
    pub fn process_at<Tz: TimeZone>(&self, source: u32, section: EitSection, now: &DateTime<Tz>) -> SectionOutcome {
        let tid = section.table_id;
        let version = section.version_number;
        let section_number = section.section_number;
        let present_following = tid == table_id::PRESENT_FOLLOWING;

        let timeout = self.config.lock_timeout();
        let tables = self.tables.get_or_insert(section.service_id);
        // Held until the section is done; the store locks nest inside it
        let Some(mut tables) = tables.try_lock_for(timeout) else {
            debug!("[EIT] sid {} section tracking busy", section.service_id);
            return SectionOutcome::StoreBusy;
        };

        let process = tables.check(tid, version, section_number);
        // 0x4E is always looked at to follow the running status
        if !present_following && !process {
            trace!(
                "[EIT] sid {} table 0x{:02X} section {} v{} already processed",
                section.service_id, tid, section_number, version
            );
            return SectionOutcome::Duplicate;
        }

        let now_secs = now.timestamp();
        if now_secs < VALID_TIME {
            debug!("[EIT] Clock not set, dropping section");
            return SectionOutcome::ClockNotSet;
        }

        let mut channels = match self.channels.write(timeout) {
            Ok(g) => g,
            Err(e) => {
                debug!("[EIT] {}", e);
                return SectionOutcome::StoreBusy;
            }
        };

        let channel_id = ChannelId::new(
            source,
            section.original_network_id,
            section.transport_stream_id,
            section.service_id,
        );
        let (channel, is_new) = match channels.get(&channel_id) {
            Some(c) => (c.clone(), false),
            None if self.config.auto_create_channels => (Channel::new(channel_id, ""), true),
            None => {
                trace!("[EIT] Unknown channel {}", channel_id);
                return SectionOutcome::ChannelRejected;
            }
        };
        if self.handlers.ignore_channel(&channel) {
            trace!("[EIT] Channel {} ignored", channel_id);
            channels.release(false);
            return SectionOutcome::ChannelRejected;
        }

        let mut schedules = match self.schedules.write(timeout) {
            Ok(g) => g,
            Err(e) => {
                debug!("[EIT] {}", e);
                channels.release(false);
                return SectionOutcome::StoreBusy;
            }
        };

        let mut channels_modified = false;
        if is_new {
            let transponder = channels.get_by_transponder_id(&channel_id).cloned();
            channels.new_channel(transponder.as_ref(), "", channel_id);
            channels_modified = true;
        }

        let schedule = schedules.get_or_create(channel_id);
        if schedule.on_actual_tp(tid) && table_id::is_schedule_other(tid) {
            trace!("[EIT] Channel {} gets 0x5X, ignoring table 0x{:02X}", channel_id, tid);
            schedules.release(false);
            channels.release(channels_modified);
            return SectionOutcome::OtherTpIgnored;
        }

        if !self.handlers.begin_segment_transfer(&channel) {
            schedules.release(false);
            channels.release(channels_modified);
            return SectionOutcome::TransferDeclined;
        }

        let handled_externally = self.handlers.handled_externally(&channel);
        let by_id = present_following || table_id::is_schedule_actual(tid);

        if present_following && section_number == 0 && process {
            schedule.reset_seen();
        }

        let mut empty = true;
        let mut modified = false;
        let linger_limit = now_secs - self.config.linger_secs;
        let mut segment: Option<(i64, i64)> = None;

        for raw in section.events {
            let schedule = schedules.get_or_create(channel_id);
            if self.handlers.handle_eit_event(schedule, &raw, tid, version) {
                continue;
            }

            let start = raw.start_time;
            let duration = raw.duration;
            // Bogus entries; NVOD references have a negative start and stay
            if start == 0 || (start > 0 && duration == 0) {
                continue;
            }
            empty = false;

            if start > 0 {
                if start + duration < linger_limit {
                    continue;
                }
                let (seg_start, seg_end) = segment.map_or((start, start + duration), |(s, e)| {
                    (s.min(start), e.max(start + duration))
                });
                segment = Some((seg_start, seg_end));
                if present_following {
                    if section_number == 0 {
                        tables.set_table_start(seg_start);
                    } else {
                        tables.set_table_end(seg_end);
                    }
                }
            }

            let found = if by_id {
                schedule.index_by_id(raw.event_id)
            } else {
                schedule.index_by_time(start)
            };

            let mut target = match found {
                Some(i) if !handled_externally => {
                    let event = schedule.event_mut(i);
                    event.seen = true;
                    if event.table_id.max(table_id::PRESENT_FOLLOWING) == table_id::PRESENT_FOLLOWING
                        && !present_following
                    {
                        continue;
                    }
                    if event.has_timer && (event.start_time != start || event.duration != duration) {
                        info!(
                            "[EIT] Channel {} event {} times changed to {}+{}s",
                            channel_id,
                            event.describe(),
                            start,
                            duration
                        );
                    }
                    let (old_id, old_start) = (event.event_id, event.start_time);
                    self.handlers.set_event_id(event, raw.event_id);
                    self.handlers.set_start_time(event, start);
                    self.handlers.set_duration(event, duration);
                    schedule.rekey(i, old_id, old_start);
                    Target::Stored(i)
                }
                _ => {
                    if handled_externally && !self.handlers.is_update(raw.event_id, start, tid, version) {
                        continue;
                    }
                    let mut event = Event::new(raw.event_id);
                    self.handlers.set_start_time(&mut event, start);
                    self.handlers.set_duration(&mut event, duration);
                    if handled_externally {
                        Target::Transient(Box::new(event))
                    } else {
                        modified = true;
                        Target::Stored(schedule.add_event(event))
                    }
                }
            };

            let event = target.get(schedule);
            if event.table_id > table_id::PRESENT_FOLLOWING {
                event.table_id = tid;
            }

            if present_following {
                if raw.running_status >= RunningStatus::NotRunning {
                    let status = override_running_status(raw.running_status, event.running_status, section_number);
                    if status != raw.running_status {
                        trace!(
                            "[EIT] Channel {} event {} keeps status {} instead of {}",
                            channel_id,
                            event.event_id,
                            status.name(),
                            raw.running_status.name()
                        );
                    }
                    let event_start = event.start_time;
                    if let Target::Transient(e) = &mut target {
                        e.running_status = status;
                    }
                    if schedule.set_running_status(target.index(), event_start, status) {
                        modified = true;
                        let present = schedule.present_event().map(|e| e.event_id);
                        if let Some(c) = channels.get_mut(&channel_id) {
                            if c.present_event != present {
                                c.present_event = present;
                                channels_modified = true;
                            }
                        }
                    }
                }
                if !process {
                    continue;
                }
            }

            target.get(schedule).version = version;

            let descriptors = EventDescriptors::collect(raw.descriptors, &self.config.languages, now);

            // Reference texts come from another schedule, so look them up
            // before taking this schedule mutably again
            let reference = descriptors.time_shifted.and_then(|ts| {
                let reference_id = ChannelId::new(source, channel_id.nid, channel_id.tsid, ts.reference_service_id);
                schedules
                    .get(&reference_id)?
                    .get_event_by_id(ts.reference_event_id)
                    .map(|e| (e.title.clone(), e.short_text.clone(), e.description.clone()))
            });

            let mut link_channels: Option<Vec<ChannelId>> = None;
            let running_now = start <= now_secs && now_secs < start + duration;
            for ld in descriptors.premiere_links.iter().filter(|_| running_now) {
                let name = link_name(&ld.private_data);
                let link_id = ChannelId::new(source, ld.original_network_id, ld.transport_stream_id, ld.service_id);
                if link_id == channel_id {
                    if let Some(c) = channels.get_mut(&channel_id) {
                        channels_modified |= c.set_portal_name(&name);
                    }
                    continue;
                }
                let update_channels = self.config.update_channels;
                if let Some(link) = channels.get_mut(&link_id) {
                    if update_channels == 1 || update_channels >= 3 {
                        channels_modified |= link.set_name(&name);
                    }
                } else if update_channels >= 4 {
                    let transponder = if channel_id.tsid != ld.transport_stream_id {
                        channels.get_by_transponder_id(&link_id).cloned()
                    } else {
                        channels.get(&channel_id).cloned()
                    };
                    channels.new_channel(transponder.as_ref(), &name, link_id);
                    channels_modified = true;
                }
                if channels.get(&link_id).is_some() {
                    link_channels.get_or_insert_with(Vec::new).push(link_id);
                }
            }

            let schedule = schedules.get_or_create(channel_id);
            let event = target.get(schedule);
            let handlers = &self.handlers;
            match reference {
                Some((title, short_text, description)) => {
                    handlers.set_title(event, title);
                    handlers.set_short_text(event, short_text);
                    handlers.set_description(event, description);
                }
                None => {
                    let (title, short_text) = match descriptors.short_event {
                        Some(sed) => (Some(sed.name), Some(sed.text)),
                        None => (None, None),
                    };
                    handlers.set_title(event, title);
                    handlers.set_short_text(event, short_text);
                    handlers.set_description(event, descriptors.extended.map(|text| text.text()));
                }
            }
            if let Some(contents) = descriptors.contents {
                handlers.set_contents(event, &contents);
            }
            if let Some(rating) = descriptors.parental_rating {
                handlers.set_parental_rating(event, rating);
            }
            if let Some(vps) = descriptors.vps {
                handlers.set_vps(event, vps);
            }
            handlers.set_components(event, descriptors.components.unwrap_or_default());

            self.handlers.fix_epg_bugs(event);
            if let Some(links) = link_channels {
                if let Some(c) = channels.get_mut(&channel_id) {
                    channels_modified |= c.set_link_channels(links);
                }
            }
            modified = true;
            self.handlers.handle_event(event);
        }

        if present_following {
            let schedule = schedules.get_or_create(channel_id);
            // An empty present section means nothing is running
            if empty && section_number == 0 {
                if schedule.clear_running_status() {
                    modified = true;
                }
                if let Some(c) = channels.get_mut(&channel_id) {
                    if c.present_event.take().is_some() {
                        channels_modified = true;
                    }
                }
            }
            schedule.set_present_seen();
        }

        let mut pruned = 0;
        if process {
            let table_complete = tables.processed(
                tid,
                section.last_table_id,
                section_number,
                section.last_section_number,
                section.segment_last_section_number,
            );
            if table_complete {
                trace!("[EIT] sid {} table 0x{:02X} v{} complete", section.service_id, tid, version);
            }
            // Schedule tables are pruned segment by segment, present/following
            // only once both sections and every table before it are in
            let prune = !present_following || tables.is_complete();
            if modified && prune {
                let (start, end) = if present_following && section.last_section_number == 1 {
                    (tables.table_start(), tables.table_end())
                } else {
                    segment.unwrap_or((0, 0))
                };
                let schedule = schedules.get_or_create(channel_id);
                self.handlers.sort_schedule(schedule);
                pruned = self
                    .handlers
                    .drop_outdated(schedule, start, end, tid, version, linger_limit);
                if pruned > 0 {
                    debug!(
                        "[EIT] Channel {} table 0x{:02X}: dropped {} outdated event(s)",
                        channel_id, tid, pruned
                    );
                    // The present event may have been among them
                    let present = schedule.present_event().map(|e| e.event_id);
                    if let Some(c) = channels.get_mut(&channel_id) {
                        if c.present_event != present {
                            c.present_event = present;
                            channels_modified = true;
                        }
                    }
                }
            }
        }

        self.handlers.end_segment_transfer(modified);
        schedules.release(modified);
        channels.release(channels_modified);

        SectionOutcome::Processed {
            modified,
            channels_modified,
            pruned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epg::handlers::EpgHandler;
    use chrono::Utc;
    use eit_protocol::{
        Descriptor, EitEvent, ExtendedEventDescriptor, LinkageDescriptor, ShortEventDescriptor,
        TimeShiftedEventDescriptor, LINKAGE_TYPE_PREMIERE, NVOD_START_TIME,
    };
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000;
    const SOURCE: u32 = 1;
    const NID: u16 = 1;
    const TSID: u16 = 1000;
    const SID: u16 = 28106;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(NOW, 0).unwrap()
    }

    fn reconciler_with(config: EpgConfig, handlers: EpgHandlers) -> EventReconciler {
        EventReconciler::new(
            config,
            Arc::new(StateLock::new("channels", Channels::new())),
            Arc::new(StateLock::new("schedules", Schedules::new())),
            Arc::new(handlers),
        )
    }

    fn reconciler() -> EventReconciler {
        reconciler_with(EpgConfig::default(), EpgHandlers::new())
    }

    fn channel_id() -> ChannelId {
        ChannelId::new(SOURCE, NID, TSID, SID)
    }

    fn event(id: u16, start: i64, duration: i64, status: RunningStatus, title: &str) -> EitEvent {
        EitEvent {
            event_id: id,
            start_time: start,
            duration,
            running_status: status,
            free_ca_mode: false,
            descriptors: vec![Descriptor::ShortEvent(ShortEventDescriptor {
                language: "deu".to_string(),
                name: title.to_string(),
                text: String::new(),
            })],
        }
    }

    fn section(tid: u8, version: u8, number: u8, last: u8, events: Vec<EitEvent>) -> EitSection {
        EitSection {
            table_id: tid,
            service_id: SID,
            version_number: version,
            section_number: number,
            last_section_number: last,
            transport_stream_id: TSID,
            original_network_id: NID,
            segment_last_section_number: last,
            last_table_id: tid,
            events,
        }
    }

    fn pf(version: u8, number: u8, events: Vec<EitEvent>) -> EitSection {
        section(table_id::PRESENT_FOLLOWING, version, number, 1, events)
    }

    fn with_schedule<R>(r: &EventReconciler, f: impl FnOnce(&Schedule) -> R) -> R {
        let schedules = r.schedules().read();
        f(schedules.get(&channel_id()).expect("schedule exists"))
    }

    fn status_of(r: &EventReconciler, id: u16) -> RunningStatus {
        with_schedule(r, |s| s.get_event_by_id(id).map(|e| e.running_status).expect("event exists"))
    }

    fn is_modified(outcome: SectionOutcome) -> bool {
        matches!(outcome, SectionOutcome::Processed { modified: true, .. })
    }

    #[test]
    fn test_present_following_end_to_end() {
        let r = reconciler();
        let present = event(100, NOW - 600, 1800, RunningStatus::Running, "Tagesschau");
        let following = event(101, NOW + 1200, 900, RunningStatus::Undefined, "Wetter");

        let out = r.process_at(SOURCE, pf(1, 0, vec![present.clone()]), &now());
        assert!(is_modified(out));
        let out = r.process_at(SOURCE, pf(1, 1, vec![following.clone()]), &now());
        assert!(is_modified(out));

        with_schedule(&r, |s| {
            assert_eq!(s.len(), 2);
            let e = s.get_event_by_id(100).unwrap();
            assert_eq!(e.title.as_deref(), Some("Tagesschau"));
            assert_eq!(e.table_id, 0x4E);
            assert_eq!(e.version, 1);
            assert_eq!(e.running_status, RunningStatus::Running);
            assert!(s.has_running());
            assert!(s.present_seen());
        });
        assert_eq!(
            r.channels().read().get(&channel_id()).and_then(|c| c.present_event),
            Some(100)
        );

        // Re-feed the present section with the event stopped
        let mut stopped = present;
        stopped.running_status = RunningStatus::NotRunning;
        let out = r.process_at(SOURCE, pf(1, 0, vec![stopped]), &now());
        assert!(is_modified(out));
        assert_eq!(status_of(&r, 100), RunningStatus::NotRunning);
        assert_eq!(
            r.channels().read().get(&channel_id()).and_then(|c| c.present_event),
            None
        );
    }

    #[test]
    fn test_refeed_is_noop() {
        let r = reconciler();
        let s = section(0x50, 3, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "A")]);
        assert!(is_modified(r.process_at(SOURCE, s.clone(), &now())));
        let version = r.schedules().version();

        assert_eq!(r.process_at(SOURCE, s, &now()), SectionOutcome::Duplicate);
        assert_eq!(r.schedules().version(), version);
    }

    #[test]
    fn test_refeed_present_following_without_status_change() {
        let r = reconciler();
        let s = pf(2, 0, vec![event(100, NOW - 60, 600, RunningStatus::Running, "A")]);
        r.process_at(SOURCE, s.clone(), &now());
        let version = r.schedules().version();

        let out = r.process_at(SOURCE, s, &now());
        assert_eq!(
            out,
            SectionOutcome::Processed { modified: false, channels_modified: false, pruned: 0 }
        );
        assert_eq!(r.schedules().version(), version);
    }

    #[test]
    fn test_version_bump_reprocesses() {
        let r = reconciler();
        let s = section(0x50, 3, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "Old")]);
        r.process_at(SOURCE, s, &now());

        let s = section(0x50, 4, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "New")]);
        assert!(is_modified(r.process_at(SOURCE, s, &now())));
        with_schedule(&r, |s| {
            let e = s.get_event_by_id(1).unwrap();
            assert_eq!(e.title.as_deref(), Some("New"));
            assert_eq!(e.version, 4);
        });
    }

    #[test]
    fn test_pausing_present_survives_not_running() {
        let r = reconciler();
        r.process_at(SOURCE, pf(1, 0, vec![event(100, NOW - 60, 600, RunningStatus::Pausing, "A")]), &now());
        assert_eq!(status_of(&r, 100), RunningStatus::Pausing);

        r.process_at(SOURCE, pf(1, 0, vec![event(100, NOW - 60, 600, RunningStatus::NotRunning, "A")]), &now());
        assert_eq!(status_of(&r, 100), RunningStatus::Pausing);

        // Running is still applied
        r.process_at(SOURCE, pf(1, 0, vec![event(100, NOW - 60, 600, RunningStatus::Running, "A")]), &now());
        assert_eq!(status_of(&r, 100), RunningStatus::Running);
    }

    #[test]
    fn test_following_not_running_becomes_undefined() {
        let r = reconciler();
        r.process_at(SOURCE, pf(1, 1, vec![event(101, NOW + 600, 600, RunningStatus::NotRunning, "B")]), &now());
        assert_eq!(status_of(&r, 101), RunningStatus::Undefined);
    }

    #[test]
    fn test_override_running_status() {
        use RunningStatus::*;
        assert_eq!(override_running_status(NotRunning, Pausing, 0), Pausing);
        assert_eq!(override_running_status(NotRunning, Running, 0), NotRunning);
        assert_eq!(override_running_status(NotRunning, Running, 1), Undefined);
        assert_eq!(override_running_status(NotRunning, NotRunning, 1), NotRunning);
        assert_eq!(override_running_status(Running, Pausing, 0), Running);
    }

    #[test]
    fn test_empty_present_section_clears_running() {
        let r = reconciler();
        r.process_at(SOURCE, pf(1, 0, vec![event(100, NOW - 60, 600, RunningStatus::Running, "A")]), &now());
        assert!(with_schedule(&r, |s| s.has_running()));

        r.process_at(SOURCE, pf(2, 0, vec![]), &now());
        assert_eq!(status_of(&r, 100), RunningStatus::NotRunning);
        assert!(!with_schedule(&r, |s| s.has_running()));
    }

    #[test]
    fn test_present_following_is_protected() {
        let r = reconciler();
        r.process_at(SOURCE, pf(1, 0, vec![event(100, NOW, 600, RunningStatus::Running, "Live")]), &now());

        let s = section(0x50, 7, 0, 0, vec![event(100, NOW, 900, RunningStatus::Undefined, "Schedule")]);
        r.process_at(SOURCE, s, &now());
        with_schedule(&r, |s| {
            let e = s.get_event_by_id(100).unwrap();
            assert_eq!(e.title.as_deref(), Some("Live"));
            assert_eq!(e.duration, 600);
            assert_eq!(e.table_id, 0x4E);
            assert!(e.seen);
        });
    }

    #[test]
    fn test_identity_by_time_for_other_tables() {
        let r = reconciler();
        // Same event id in two 0x6X tables but different start times
        r.process_at(SOURCE, section(0x60, 1, 0, 0, vec![event(7, NOW, 600, RunningStatus::Undefined, "A")]), &now());
        r.process_at(SOURCE, section(0x61, 1, 0, 0, vec![event(7, NOW + 86400, 600, RunningStatus::Undefined, "B")]), &now());
        with_schedule(&r, |s| assert_eq!(s.len(), 2));

        // A 0x6X event at a known start time updates that event, whatever its id
        r.process_at(SOURCE, section(0x60, 2, 0, 0, vec![event(8, NOW, 600, RunningStatus::Undefined, "A2")]), &now());
        with_schedule(&r, |s| {
            assert_eq!(s.len(), 2);
            let e = s.get_event_by_id(8).unwrap();
            assert_eq!(e.start_time, NOW);
            assert_eq!(e.title.as_deref(), Some("A2"));
        });
    }

    #[test]
    fn test_other_tp_ignored_after_actual() {
        let r = reconciler();
        r.process_at(SOURCE, section(0x50, 1, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "A")]), &now());
        let version = r.schedules().version();

        let out = r.process_at(
            SOURCE,
            section(0x60, 1, 0, 0, vec![event(2, NOW + 600, 600, RunningStatus::Undefined, "B")]),
            &now(),
        );
        assert_eq!(out, SectionOutcome::OtherTpIgnored);
        assert_eq!(r.schedules().version(), version);
        with_schedule(&r, |s| assert!(s.get_event_by_id(2).is_none()));
    }

    #[test]
    fn test_bogus_and_expired_events() {
        let r = reconciler();
        let events = vec![
            event(1, 0, 600, RunningStatus::Undefined, "zero start"),
            event(2, NOW, 0, RunningStatus::Undefined, "zero duration"),
            event(3, NOW - 86400, 600, RunningStatus::Undefined, "long gone"),
            event(4, NVOD_START_TIME, 0, RunningStatus::Undefined, "NVOD"),
            event(5, NOW, 600, RunningStatus::Undefined, "ok"),
        ];
        r.process_at(SOURCE, section(0x50, 1, 0, 0, events), &now());
        with_schedule(&r, |s| {
            let ids: Vec<u16> = s.events().iter().map(|e| e.event_id).collect();
            assert_eq!(ids, vec![4, 5]);
        });
    }

    #[test]
    fn test_segment_pruning() {
        let r = reconciler();
        let linger = EpgConfig::default().linger_secs;
        let s = section(
            0x50,
            1,
            0,
            0,
            vec![
                event(1, NOW - linger - 599, 600, RunningStatus::Undefined, "ends after limit"),
                event(2, NOW, 600, RunningStatus::Undefined, "old version"),
            ],
        );
        r.process_at(SOURCE, s, &now());

        // A later clock: event 1 now ended before the limit
        let later = Utc.timestamp_opt(NOW + 2, 0).unwrap();
        let s = section(0x50, 2, 0, 0, vec![event(3, NOW + 300, 600, RunningStatus::Undefined, "new")]);
        let out = r.process_at(SOURCE, s, &later);
        assert_eq!(
            out,
            SectionOutcome::Processed { modified: true, channels_modified: false, pruned: 2 }
        );
        with_schedule(&r, |s| {
            let ids: Vec<u16> = s.events().iter().map(|e| e.event_id).collect();
            assert_eq!(ids, vec![3]);
        });
    }

    #[test]
    fn test_pruning_keeps_event_one_second_inside_linger() {
        let r = reconciler();
        let linger = EpgConfig::default().linger_secs;
        r.process_at(
            SOURCE,
            section(0x50, 1, 0, 0, vec![event(1, NOW - linger - 599, 600, RunningStatus::Undefined, "x")]),
            &now(),
        );
        r.process_at(
            SOURCE,
            section(0x51, 1, 0, 0, vec![event(2, NOW + 3600, 600, RunningStatus::Undefined, "y")]),
            &now(),
        );
        with_schedule(&r, |s| assert!(s.get_event_by_id(1).is_some()));
    }

    #[test]
    fn test_clock_not_set() {
        let r = reconciler();
        let early = Utc.timestamp_opt(VALID_TIME - 1, 0).unwrap();
        let s = section(0x50, 1, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "A")]);
        assert_eq!(r.process_at(SOURCE, s, &early), SectionOutcome::ClockNotSet);
        assert!(r.schedules().read().is_empty());
    }

    #[test]
    fn test_store_busy() {
        let r = reconciler();
        let _held = r.schedules().write(Duration::from_secs(1)).unwrap();
        let s = section(0x50, 1, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "A")]);
        assert_eq!(r.process_at(SOURCE, s, &now()), SectionOutcome::StoreBusy);
        assert!(r.channels().read().is_empty());
    }

    #[test]
    fn test_channel_creation_disabled() {
        let config = EpgConfig {
            auto_create_channels: false,
            ..Default::default()
        };
        let r = reconciler_with(config, EpgHandlers::new());
        let s = section(0x50, 1, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "A")]);
        assert_eq!(r.process_at(SOURCE, s, &now()), SectionOutcome::ChannelRejected);
        assert_eq!(r.channels().version(), 0);
    }

    struct IgnoreAll;

    impl EpgHandler for IgnoreAll {
        fn ignore_channel(&self, _channel: &Channel) -> bool {
            true
        }
    }

    #[test]
    fn test_ignored_channel_not_created() {
        let mut handlers = EpgHandlers::new();
        handlers.register(Box::new(IgnoreAll));
        let r = reconciler_with(EpgConfig::default(), handlers);
        let s = section(0x50, 1, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "A")]);
        assert_eq!(r.process_at(SOURCE, s, &now()), SectionOutcome::ChannelRejected);
        assert!(r.channels().read().is_empty());
    }

    #[test]
    fn test_descriptor_merge() {
        let r = reconciler();
        let mut e = event(1, NOW, 600, RunningStatus::Undefined, "Tatort");
        e.descriptors.push(Descriptor::ExtendedEvent(ExtendedEventDescriptor {
            descriptor_number: 0,
            last_descriptor_number: 0,
            language: "deu".to_string(),
            items: Vec::new(),
            text: "Ein Fall.".to_string(),
        }));
        r.process_at(SOURCE, section(0x50, 1, 0, 0, vec![e]), &now());
        with_schedule(&r, |s| {
            let e = s.get_event_by_id(1).unwrap();
            assert_eq!(e.title.as_deref(), Some("Tatort"));
            // Empty short text was removed by the fixer
            assert_eq!(e.short_text, None);
            assert_eq!(e.description.as_deref(), Some("Ein Fall."));
        });
    }

    #[test]
    fn test_time_shifted_reference() {
        let r = reconciler();
        r.process_at(SOURCE, section(0x50, 1, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "Original")]), &now());

        let mut shifted = section(
            0x50,
            1,
            0,
            0,
            vec![EitEvent {
                event_id: 9,
                start_time: NOW + 3600,
                duration: 600,
                running_status: RunningStatus::Undefined,
                free_ca_mode: false,
                descriptors: vec![Descriptor::TimeShiftedEvent(TimeShiftedEventDescriptor {
                    reference_service_id: SID,
                    reference_event_id: 1,
                })],
            }],
        );
        shifted.service_id = SID + 1;
        r.process_at(SOURCE, shifted, &now());

        let schedules = r.schedules().read();
        let s = schedules.get(&ChannelId::new(SOURCE, NID, TSID, SID + 1)).unwrap();
        assert_eq!(s.get_event_by_id(9).unwrap().title.as_deref(), Some("Original"));
    }

    #[test]
    fn test_premiere_linkage_creates_and_links() {
        let r = reconciler();
        let mut e = event(1, NOW - 60, 600, RunningStatus::Running, "Portal");
        e.descriptors.push(Descriptor::Linkage(LinkageDescriptor {
            transport_stream_id: TSID,
            original_network_id: NID,
            service_id: 17,
            linkage_type: LINKAGE_TYPE_PREMIERE,
            private_data: b"Feed 1".to_vec(),
        }));
        e.descriptors.push(Descriptor::Linkage(LinkageDescriptor {
            transport_stream_id: TSID,
            original_network_id: NID,
            service_id: SID,
            linkage_type: LINKAGE_TYPE_PREMIERE,
            private_data: b"Premiere Portal\0".to_vec(),
        }));
        let out = r.process_at(SOURCE, section(0x50, 1, 0, 0, vec![e]), &now());
        assert!(matches!(out, SectionOutcome::Processed { channels_modified: true, .. }));

        let channels = r.channels().read();
        let link_id = ChannelId::new(SOURCE, NID, TSID, 17);
        assert_eq!(channels.get(&link_id).unwrap().name, "Feed 1");
        let own = channels.get(&channel_id()).unwrap();
        assert_eq!(own.portal_name, "Premiere Portal");
        assert_eq!(own.link_channels, vec![link_id]);
    }

    #[test]
    fn test_pruning_updates_present_event() {
        let r = reconciler();
        r.process_at(SOURCE, pf(1, 0, vec![event(100, NOW - 60, 600, RunningStatus::Running, "A")]), &now());
        assert_eq!(
            r.channels().read().get(&channel_id()).and_then(|c| c.present_event),
            Some(100)
        );

        let later = Utc.timestamp_opt(NOW + 6 * 3600, 0).unwrap();
        let s = section(0x50, 1, 0, 0, vec![event(200, NOW + 6 * 3600, 600, RunningStatus::Undefined, "B")]);
        let out = r.process_at(SOURCE, s, &later);
        assert_eq!(
            out,
            SectionOutcome::Processed { modified: true, channels_modified: true, pruned: 1 }
        );
        assert_eq!(r.channels().read().get(&channel_id()).and_then(|c| c.present_event), None);
        with_schedule(&r, |s| assert!(s.get_event_by_id(100).is_none()));
    }

    #[test]
    fn test_present_following_prunes_once_both_sections_are_in() {
        let r = reconciler();
        r.process_at(SOURCE, section(0x50, 1, 0, 0, vec![event(50, NOW + 100, 300, RunningStatus::Undefined, "X")]), &now());

        let out = r.process_at(SOURCE, pf(1, 0, vec![event(100, NOW - 60, 600, RunningStatus::Running, "A")]), &now());
        assert!(matches!(out, SectionOutcome::Processed { pruned: 0, .. }));
        with_schedule(&r, |s| assert!(s.get_event_by_id(50).is_some()));

        // Window runs from the present start to the following end
        let out = r.process_at(SOURCE, pf(1, 1, vec![event(101, NOW + 540, 600, RunningStatus::Undefined, "B")]), &now());
        assert!(matches!(out, SectionOutcome::Processed { pruned: 1, .. }));
        with_schedule(&r, |s| {
            let ids: Vec<u16> = s.events().iter().map(|e| e.event_id).collect();
            assert_eq!(ids, vec![100, 101]);
        });
    }

    fn linkage_to(service_id: u16) -> EitSection {
        let mut e = event(1, NOW - 60, 600, RunningStatus::Running, "Portal");
        e.descriptors.push(Descriptor::Linkage(LinkageDescriptor {
            transport_stream_id: TSID,
            original_network_id: NID,
            service_id,
            linkage_type: LINKAGE_TYPE_PREMIERE,
            private_data: b"Feed 1".to_vec(),
        }));
        section(0x50, 1, 0, 0, vec![e])
    }

    #[test]
    fn test_update_channels_gates_linked_channels() {
        let link_id = ChannelId::new(SOURCE, NID, TSID, 17);
        for level in 0..=5u8 {
            let config = EpgConfig {
                update_channels: level,
                ..Default::default()
            };

            let r = reconciler_with(config.clone(), EpgHandlers::new());
            let mut channels = r.channels().write(Duration::from_secs(1)).unwrap();
            channels.new_channel(None, "Old", link_id);
            channels.release(true);
            r.process_at(SOURCE, linkage_to(17), &now());
            let renamed = r.channels().read().get(&link_id).map(|c| c.name.clone());
            let expected = if level == 1 || level >= 3 { "Feed 1" } else { "Old" };
            assert_eq!(renamed.as_deref(), Some(expected), "rename at level {}", level);

            let r = reconciler_with(config, EpgHandlers::new());
            r.process_at(SOURCE, linkage_to(17), &now());
            let created = r.channels().read().get(&link_id).is_some();
            assert_eq!(created, level >= 4, "create at level {}", level);
            let links = r
                .channels()
                .read()
                .get(&channel_id())
                .map(|c| c.link_channels.clone())
                .unwrap_or_default();
            assert_eq!(links.is_empty(), level < 4, "links at level {}", level);
        }
    }

    struct Shouting;

    impl EpgHandler for Shouting {
        fn set_title(&self, event: &mut Event, title: Option<&str>) -> bool {
            event.title = title.map(str::to_uppercase);
            true
        }

        fn set_duration(&self, event: &mut Event, duration: i64) -> bool {
            event.duration = duration + 60;
            true
        }

        fn drop_outdated(&self, _: &mut Schedule, _: i64, _: i64, _: u8, _: u8, _: i64) -> bool {
            true
        }
    }

    #[test]
    fn test_field_writes_go_through_handlers() {
        let mut handlers = EpgHandlers::new();
        handlers.register(Box::new(Shouting));
        let r = reconciler_with(EpgConfig::default(), handlers);

        r.process_at(SOURCE, section(0x50, 1, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "Tatort")]), &now());
        // A new version would normally drop event 1
        let out = r.process_at(
            SOURCE,
            section(0x50, 2, 0, 0, vec![event(2, NOW + 300, 600, RunningStatus::Undefined, "Wetter")]),
            &now(),
        );
        assert!(matches!(out, SectionOutcome::Processed { pruned: 0, .. }));
        with_schedule(&r, |s| {
            let e = s.get_event_by_id(1).unwrap();
            assert_eq!(e.title.as_deref(), Some("TATORT"));
            assert_eq!(e.duration, 660);
            assert_eq!(s.len(), 2);
        });
    }

    #[test]
    fn test_busy_section_tracking() {
        let r = reconciler();
        let tables = r.tables.get_or_insert(SID);
        let _held = tables.lock();
        let s = section(0x50, 1, 0, 0, vec![event(1, NOW, 600, RunningStatus::Undefined, "A")]);
        assert_eq!(r.process_at(SOURCE, s, &now()), SectionOutcome::StoreBusy);
        assert!(r.schedules().read().is_empty());
    }

    struct External;

    impl EpgHandler for External {
        fn handled_externally(&self, _channel: &Channel) -> bool {
            true
        }

        fn is_update(&self, event_id: u16, _start_time: i64, _table_id: u8, _version: u8) -> bool {
            event_id == 1
        }
    }

    #[test]
    fn test_handled_externally_stores_nothing() {
        let mut handlers = EpgHandlers::new();
        handlers.register(Box::new(External));
        let r = reconciler_with(EpgConfig::default(), handlers);
        let s = section(
            0x50,
            1,
            0,
            0,
            vec![
                event(1, NOW, 600, RunningStatus::Undefined, "A"),
                event(2, NOW + 600, 600, RunningStatus::Undefined, "B"),
            ],
        );
        let out = r.process_at(SOURCE, s, &now());
        assert!(is_modified(out));
        with_schedule(&r, |s| assert!(s.is_empty()));
    }
}
