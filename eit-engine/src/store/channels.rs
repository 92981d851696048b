//! Channel store.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Unique channel identifier.
///
/// `source` identifies the delivery system the section arrived from; the
/// remaining fields are the DVB triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChannelId {
    pub source: u32,
    pub nid: u16,
    pub tsid: u16,
    pub sid: u16,
}

impl ChannelId {
    pub fn new(source: u32, nid: u16, tsid: u16, sid: u16) -> Self {
        Self { source, nid, tsid, sid }
    }

    /// Same source, network and transport stream.
    pub fn same_transponder(&self, other: &ChannelId) -> bool {
        self.source == other.source && self.nid == other.nid && self.tsid == other.tsid
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.source, self.nid, self.tsid, self.sid)
    }
}

/// A broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub id: ChannelId,
    /// Display name.
    pub name: String,
    /// Name announced for a portal (multi-feed) channel.
    pub portal_name: String,
    /// Transponder frequency in MHz, 0 when unknown.
    pub frequency: u32,
    /// Channels linked from this one.
    pub link_channels: Vec<ChannelId>,
    /// Event id of the event currently running or pausing.
    pub present_event: Option<u16>,
}

impl Channel {
    pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            portal_name: String::new(),
            frequency: 0,
            link_channels: Vec::new(),
            present_event: None,
        }
    }

    /// Set the display name. Returns true if it changed.
    pub fn set_name(&mut self, name: &str) -> bool {
        if self.name == name {
            return false;
        }
        log::info!("[Channels] {} renamed from '{}' to '{}'", self.id, self.name, name);
        self.name = name.to_string();
        true
    }

    /// Set the portal name. Returns true if it changed.
    pub fn set_portal_name(&mut self, name: &str) -> bool {
        if self.portal_name == name {
            return false;
        }
        log::info!("[Channels] {} portal name set to '{}'", self.id, name);
        self.portal_name = name.to_string();
        true
    }

    /// Replace the linked channel set. Returns true if it changed.
    pub fn set_link_channels(&mut self, links: Vec<ChannelId>) -> bool {
        if self.link_channels == links {
            return false;
        }
        log::debug!("[Channels] {} now links to {} channel(s)", self.id, links.len());
        self.link_channels = links;
        true
    }
}

/// All known channels.
#[derive(Debug, Default)]
pub struct Channels {
    channels: BTreeMap<ChannelId, Channel>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn get_mut(&mut self, id: &ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    /// First channel on the same transponder as `id`.
    pub fn get_by_transponder_id(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.values().find(|c| c.id.same_transponder(id))
    }

    /// Insert a channel, replacing any existing one with the same id.
    pub fn insert(&mut self, channel: Channel) -> &mut Channel {
        match self.channels.entry(channel.id) {
            Entry::Occupied(mut e) => {
                e.insert(channel);
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(channel),
        }
    }

    /// Create a channel, copying the tuning parameters of `transponder`.
    pub fn new_channel(&mut self, transponder: Option<&Channel>, name: &str, id: ChannelId) -> &mut Channel {
        let mut channel = Channel::new(id, name);
        if let Some(t) = transponder {
            channel.frequency = t.frequency;
        }
        log::info!("[Channels] New channel {} '{}'", id, name);
        self.insert(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }
}
