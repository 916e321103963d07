use crate::backend::{BackendHandle, CatalogHandle};
use crate::change::{ChangeStatus, ChangeType, Channel, PendingChange};
use crate::error::{Error, ErrorKind, Result};
use crate::scope::{self, Scope, Target};
use derive_more::Display;
use exn::ResultExt;
use folio_progress::ProgressCoordinator;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// When to reload the catalog after a batch has settled.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    #[display("never")]
    Never,
    /// Only when the device channel was touched.
    #[default]
    #[display("sync")]
    Sync,
    #[display("always")]
    Always,
}
impl RefreshPolicy {
    pub fn should_refresh(self, device_touched: bool) -> bool {
        match self {
            Self::Never => false,
            Self::Sync => device_touched,
            Self::Always => true,
        }
    }
}
impl FromStr for RefreshPolicy {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "sync" => Ok(Self::Sync),
            "always" => Ok(Self::Always),
            _ => exn::bail!(ErrorKind::UnknownRefreshPolicy(s.to_string())),
        }
    }
}

/// Per-call knobs for [`Ledger::apply()`] and [`Ledger::remove()`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Overrides the ledger's default refresh policy.
    pub refresh: Option<RefreshPolicy>,
    /// The caller has confirmed a destructive bulk apply.
    pub confirmed: bool,
}
impl BatchOptions {
    pub fn refresh(mut self, policy: RefreshPolicy) -> Self {
        self.refresh = Some(policy);
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

/// How one channel's command went.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// Nothing in scope for this channel; no command was issued.
    Skipped,
    Settled { affected: u64 },
    /// The command as a whole failed. On apply, every pending change in this
    /// channel's scope is then marked `error` with `message`; `failed` counts
    /// how many were.
    Failed { message: String, failed: u64 },
}
impl ChannelOutcome {
    pub fn touched(&self) -> bool {
        !matches!(self, Self::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    NotRequested,
    Refreshed,
    /// The policy asked for a refresh but no catalog is attached.
    NoCatalog,
    Failed { message: String },
}

/// Settled result of an apply or remove call.
///
/// Not atomic: either channel can fail independently of the other. Per-item
/// outcomes are observed by listing changes again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReport {
    pub file: ChannelOutcome,
    pub device: ChannelOutcome,
    pub refresh: RefreshOutcome,
}
impl BatchReport {
    pub fn channel(&self, channel: Channel) -> &ChannelOutcome {
        match channel {
            Channel::File => &self.file,
            Channel::Device => &self.device,
        }
    }

    pub fn failed_channels(&self) -> Vec<Channel> {
        Channel::ALL.into_iter().filter(|channel| self.channel(*channel).is_failed()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_channels().is_empty() && !matches!(self.refresh, RefreshOutcome::Failed { .. })
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
enum Command {
    #[display("apply")]
    Apply,
    #[display("remove")]
    Remove,
}

/// Ids and wildcards currently being worked on, per channel.
#[derive(Debug, Default)]
struct Claims {
    wildcard: HashSet<Channel>,
    ids: HashMap<Channel, HashSet<String>>,
}
impl Claims {
    fn overlaps(&self, channel: Channel, target: &Target) -> bool {
        if self.wildcard.contains(&channel) {
            return true;
        }
        let Some(claimed) = self.ids.get(&channel) else {
            return false;
        };
        match target {
            Target::All => !claimed.is_empty(),
            Target::Ids(ids) => ids.iter().any(|id| claimed.contains(id.as_str())),
        }
    }

    fn claim(&mut self, channel: Channel, target: &Target) {
        match target {
            Target::All => {
                self.wildcard.insert(channel);
            },
            Target::Ids(ids) => {
                self.ids.entry(channel).or_default().extend(ids.iter().map(|id| id.as_str().to_string()));
            },
        }
    }

    fn release(&mut self, channel: Channel, target: &Target) {
        match target {
            Target::All => {
                self.wildcard.remove(&channel);
            },
            Target::Ids(ids) => {
                if let Some(claimed) = self.ids.get_mut(&channel) {
                    for id in ids {
                        claimed.remove(id.as_str());
                    }
                }
            },
        }
    }
}

/// Releases a batch's claims when the batch settles (or its future is dropped).
struct ClaimGuard {
    claims: Arc<Mutex<Claims>>,
    plan: BTreeMap<Channel, Target>,
}
impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        for (channel, target) in &self.plan {
            claims.release(*channel, target);
        }
    }
}

/// The staged-change queue.
///
/// Reads always go to the backend; the ledger keeps no copy of the changes.
/// Apply and remove split their scope by channel and issue one command per
/// non-empty channel, awaiting both before settling the batch.
pub struct Ledger {
    backend: BackendHandle,
    catalog: Option<CatalogHandle>,
    coordinators: BTreeMap<Channel, Arc<ProgressCoordinator>>,
    refresh: RefreshPolicy,
    claims: Arc<Mutex<Claims>>,
}

impl Ledger {
    pub fn new(backend: BackendHandle) -> Self {
        Self {
            backend,
            catalog: None,
            coordinators: BTreeMap::new(),
            refresh: RefreshPolicy::default(),
            claims: Arc::new(Mutex::new(Claims::default())),
        }
    }

    pub fn with_catalog(mut self, catalog: CatalogHandle) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Observe `channel`'s applies with `coordinator`. It is (re)started right
    /// before each apply command so that no progress event is missed.
    pub fn with_coordinator(mut self, channel: Channel, coordinator: Arc<ProgressCoordinator>) -> Self {
        self.coordinators.insert(channel, coordinator);
        self
    }

    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh = policy;
        self
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        self.refresh
    }

    pub fn coordinator(&self, channel: Channel) -> Option<&Arc<ProgressCoordinator>> {
        self.coordinators.get(&channel)
    }

    pub fn classify(change_type: ChangeType) -> Channel {
        change_type.channel()
    }

    /// Changes with the given status (or every change), oldest first.
    pub async fn list_by_status(&self, status: Option<ChangeStatus>) -> Result<Vec<PendingChange>> {
        self.backend.list_changes(status).await.or_raise(|| ErrorKind::Listing)
    }

    /// Number of pending destructive changes an apply of `scope` would act on.
    ///
    /// For a wildcard scope this asks the backend, since the caller may not
    /// have every matching change loaded.
    pub async fn destructive_count(&self, scope: &Scope) -> Result<usize> {
        match scope {
            Scope::Selected(changes) => Ok(scope::count_destructive(changes)),
            Scope::Matching(filter) => {
                let pending = self.list_by_status(Some(ChangeStatus::Pending)).await?;
                Ok(scope::count_destructive(pending.iter().filter(|change| filter.matches(change))))
            },
        }
    }

    /// Apply every pending change in `scope`.
    ///
    /// A wildcard or multi-item scope that contains a `delete` is refused with
    /// [`ErrorKind::ConfirmationRequired`] unless `options.confirmed` is set; a
    /// single explicitly selected delete goes through. A scope that overlaps
    /// another apply or remove still in flight is refused with
    /// [`ErrorKind::Busy`] before any command is issued.
    #[tracing::instrument(skip_all, fields(backend = %self.backend.name(), wildcard = scope.is_wildcard()))]
    pub async fn apply(&self, scope: &Scope, options: BatchOptions) -> Result<BatchReport> {
        if !options.confirmed && self.needs_confirmation(scope) {
            let destructive = self.destructive_count(scope).await?;
            if destructive > 0 {
                exn::bail!(ErrorKind::ConfirmationRequired(destructive));
            }
        }
        self.run(Command::Apply, scope, options).await
    }

    /// Discard every pending change in `scope`. Changes that were already
    /// applied, failed or removed are left alone, so repeating a remove is a
    /// no-op.
    #[tracing::instrument(skip_all, fields(backend = %self.backend.name(), wildcard = scope.is_wildcard()))]
    pub async fn remove(&self, scope: &Scope, options: BatchOptions) -> Result<BatchReport> {
        self.run(Command::Remove, scope, options).await
    }

    fn needs_confirmation(&self, scope: &Scope) -> bool {
        match scope {
            Scope::Selected(changes) => changes.iter().filter(|change| change.is_pending()).count() > 1,
            Scope::Matching(_) => true,
        }
    }

    async fn run(&self, command: Command, scope: &Scope, options: BatchOptions) -> Result<BatchReport> {
        let plan = self.plan(scope).await?;
        if plan.is_empty() {
            tracing::debug!(%command, "Nothing pending in scope");
        }
        let claims = self.claim(plan)?;
        let plan = &claims.plan;

        let (file, device) = futures::join!(
            self.dispatch(command, Channel::File, plan.get(&Channel::File)),
            self.dispatch(command, Channel::Device, plan.get(&Channel::Device)),
        );
        let policy = options.refresh.unwrap_or(self.refresh);
        let refresh = self.refresh(policy, device.touched()).await;
        let report = BatchReport { file, device, refresh };
        tracing::info!(
            %command,
            file = ?report.file,
            device = ?report.device,
            refresh = ?report.refresh,
            "Batch settled"
        );
        Ok(report)
    }

    /// Split `scope` into one target per channel that has anything to do.
    async fn plan(&self, scope: &Scope) -> Result<BTreeMap<Channel, Target>> {
        match scope {
            Scope::Selected(changes) => Ok(scope::group_by_channel(changes)
                .into_iter()
                .map(|(channel, ids)| (channel, Target::Ids(ids)))
                .collect()),
            Scope::Matching(filter) if filter.device_id.is_none() => {
                Ok(filter.channels().into_iter().map(|channel| (channel, Target::All)).collect())
            },
            Scope::Matching(filter) => {
                // The backend's wildcard form cannot express a device filter.
                let pending = self.list_by_status(Some(ChangeStatus::Pending)).await?;
                Ok(scope::group_by_channel(pending.iter().filter(|change| filter.matches(change)))
                    .into_iter()
                    .map(|(channel, ids)| (channel, Target::Ids(ids)))
                    .collect())
            },
        }
    }

    fn claim(&self, plan: BTreeMap<Channel, Target>) -> Result<ClaimGuard> {
        let mut claims = self.lock_claims();
        let busy = plan
            .iter()
            .find(|(channel, target)| claims.overlaps(**channel, target))
            .map(|(channel, _)| *channel);
        if let Some(channel) = busy {
            tracing::warn!(%channel, "Refusing overlapping batch");
            exn::bail!(ErrorKind::Busy(channel));
        }
        for (channel, target) in &plan {
            claims.claim(*channel, target);
        }
        drop(claims);
        Ok(ClaimGuard { claims: self.claims.clone(), plan })
    }

    fn lock_claims(&self) -> MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, command: Command, channel: Channel, target: Option<&Target>) -> ChannelOutcome {
        let Some(target) = target else {
            return ChannelOutcome::Skipped;
        };
        let name = match command {
            Command::Apply => channel.apply_command(),
            Command::Remove => channel.remove_command(),
        };
        if command == Command::Apply
            && let Some(coordinator) = self.coordinators.get(&channel)
        {
            coordinator.start();
        }
        tracing::debug!(%channel, command = name, ids = ?target.to_wire(), "Issuing channel command");
        let result = match command {
            Command::Apply => self.backend.apply_changes(channel, target).await,
            Command::Remove => self.backend.remove_changes(channel, target).await,
        };
        match result {
            Ok(affected) => {
                tracing::debug!(%channel, command = name, affected, "Channel command settled");
                ChannelOutcome::Settled { affected }
            },
            Err(err) => {
                tracing::error!(%channel, command = name, error = ?err, "Channel command failed");
                let message = (*err).to_string();
                let failed = match command {
                    Command::Apply => self.fail(channel, target, &message).await,
                    Command::Remove => 0,
                };
                ChannelOutcome::Failed { message, failed }
            },
        }
    }

    async fn fail(&self, channel: Channel, target: &Target, message: &str) -> u64 {
        match self.backend.fail_changes(channel, target, message).await {
            Ok(failed) => failed,
            Err(err) => {
                tracing::error!(%channel, error = ?err, "Could not record channel failure on its changes");
                0
            },
        }
    }

    async fn refresh(&self, policy: RefreshPolicy, device_touched: bool) -> RefreshOutcome {
        if !policy.should_refresh(device_touched) {
            return RefreshOutcome::NotRequested;
        }
        let Some(catalog) = &self.catalog else {
            tracing::debug!(%policy, "Refresh requested but no catalog attached");
            return RefreshOutcome::NoCatalog;
        };
        match catalog.reload().await.or_raise(|| ErrorKind::Catalog) {
            Ok(()) => RefreshOutcome::Refreshed,
            Err(err) => {
                tracing::warn!(error = ?err, "Catalog refresh failed");
                RefreshOutcome::Failed { message: (*err).to_string() }
            },
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("backend", &self.backend.name())
            .field("catalog", &self.catalog.is_some())
            .field("coordinators", &self.coordinators.keys().collect::<Vec<_>>())
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeId;
    use rstest::rstest;

    #[rstest]
    #[case(RefreshPolicy::Never, false, false)]
    #[case(RefreshPolicy::Never, true, false)]
    #[case(RefreshPolicy::Sync, false, false)]
    #[case(RefreshPolicy::Sync, true, true)]
    #[case(RefreshPolicy::Always, false, true)]
    #[case(RefreshPolicy::Always, true, true)]
    fn test_should_refresh(#[case] policy: RefreshPolicy, #[case] device_touched: bool, #[case] expected: bool) {
        assert_eq!(policy.should_refresh(device_touched), expected);
    }

    #[rstest]
    #[case("never", RefreshPolicy::Never)]
    #[case("Sync", RefreshPolicy::Sync)]
    #[case("ALWAYS", RefreshPolicy::Always)]
    fn test_parse_refresh_policy(#[case] raw: &str, #[case] expected: RefreshPolicy) {
        assert_eq!(raw.parse::<RefreshPolicy>().unwrap(), expected);
    }

    fn ids(ids: &[&str]) -> Target {
        Target::Ids(ids.iter().copied().map(ChangeId::from).collect())
    }

    #[test]
    fn test_claims_overlap() {
        let mut claims = Claims::default();
        claims.claim(Channel::File, &ids(&["a", "b"]));
        assert!(claims.overlaps(Channel::File, &ids(&["b", "c"])));
        assert!(claims.overlaps(Channel::File, &Target::All));
        assert!(!claims.overlaps(Channel::File, &ids(&["c"])));
        assert!(!claims.overlaps(Channel::Device, &Target::All));

        claims.claim(Channel::Device, &Target::All);
        assert!(claims.overlaps(Channel::Device, &ids(&["z"])));

        claims.release(Channel::File, &ids(&["a", "b"]));
        claims.release(Channel::Device, &Target::All);
        assert!(!claims.overlaps(Channel::File, &Target::All));
        assert!(!claims.overlaps(Channel::Device, &Target::All));
    }

    #[test]
    fn test_report_failures() {
        let report = BatchReport {
            file: ChannelOutcome::Settled { affected: 2 },
            device: ChannelOutcome::Failed { message: "unplugged".to_string(), failed: 1 },
            refresh: RefreshOutcome::NotRequested,
        };
        assert_eq!(report.failed_channels(), [Channel::Device]);
        assert!(!report.is_clean());
        assert!(report.channel(Channel::File).touched());
    }
}
