use crate::change::{ChangeId, Channel, PendingChange};

/// What a single channel command operates on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Every pending change in the channel, resolved by the backend.
    All,
    Ids(Vec<ChangeId>),
}

impl Target {
    /// Id list as sent to the backend, where an empty list means "all pending".
    pub fn to_wire(&self) -> Vec<String> {
        match self {
            Self::All => Vec::new(),
            Self::Ids(ids) => ids.iter().map(|id| id.as_str().to_string()).collect(),
        }
    }

    pub fn from_wire(ids: Vec<String>) -> Self {
        if ids.is_empty() {
            return Self::All;
        }
        Self::Ids(ids.into_iter().map(ChangeId::from).collect())
    }

    pub fn includes(&self, id: &ChangeId) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.contains(id),
        }
    }
}

/// The "current filters" a wildcard scope is evaluated against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    pub channel: Option<Channel>,
    /// Restricts device changes to one eReader. File changes never match a
    /// device filter.
    pub device_id: Option<String>,
}

impl ChangeFilter {
    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|channel| self.channel.is_none_or(|only| only == *channel))
            .filter(|channel| self.device_id.is_none() || *channel == Channel::Device)
            .collect()
    }

    pub fn matches(&self, change: &PendingChange) -> bool {
        if !self.channels().contains(&change.channel()) {
            return false;
        }
        match &self.device_id {
            Some(device) => change.device_id.as_deref() == Some(device.as_str()),
            None => true,
        }
    }
}

/// The set of changes an apply or remove call is asked to act on.
#[derive(Clone, Debug)]
pub enum Scope {
    /// Changes the user explicitly picked. Only those still `pending` are acted on.
    Selected(Vec<PendingChange>),
    /// Everything pending that matches the filter, including changes the
    /// caller has not loaded.
    Matching(ChangeFilter),
}

impl Scope {
    pub fn all() -> Self {
        Self::Matching(ChangeFilter::default())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Matching(_))
    }
}

/// Whether any of `changes` would destroy data when applied.
pub fn contains_destructive<'a>(changes: impl IntoIterator<Item = &'a PendingChange>) -> bool {
    changes.into_iter().any(|change| change.change_type.is_destructive())
}

pub(crate) fn count_destructive<'a>(changes: impl IntoIterator<Item = &'a PendingChange>) -> usize {
    changes
        .into_iter()
        .filter(|change| change.is_pending() && change.change_type.is_destructive())
        .count()
}

/// Group pending changes by channel, keeping their relative order. Channels
/// with nothing pending are left out.
pub(crate) fn group_by_channel<'a>(
    changes: impl IntoIterator<Item = &'a PendingChange>,
) -> Vec<(Channel, Vec<ChangeId>)> {
    let mut groups: Vec<(Channel, Vec<ChangeId>)> = Channel::ALL.into_iter().map(|channel| (channel, Vec::new())).collect();
    for change in changes.into_iter().filter(|change| change.is_pending()) {
        if let Some((_, ids)) = groups.iter_mut().find(|(channel, _)| *channel == change.channel()) {
            ids.push(change.id.clone());
        }
    }
    groups.retain(|(_, ids)| !ids.is_empty());
    groups
}
