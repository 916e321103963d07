//! Command execution against the local store.

use crate::cli::{ChangesCommand, Command, CoversCommand, ScopeArgs, Selection, parse_status};
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use folio_assets::AssetCache;
use folio_config::Config;
use folio_ledger::{BatchReport, CatalogRefresher, ChangeStatus, Channel, ChannelOutcome, Ledger, RefreshOutcome, Scope};
use folio_progress::{BroadcastBus, BusHandle, ProgressCoordinator};
use folio_store::{ChangeRepository, CoverStore, Database, LocalExecutor, SqliteChangeBackend};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;

/// There is no catalog view behind the CLI, so a reload is only logged.
#[derive(Debug, Default)]
struct LoggingCatalog;

#[async_trait]
impl CatalogRefresher for LoggingCatalog {
    async fn reload(&self) -> folio_ledger::error::Result<()> {
        tracing::info!("Catalog reload requested");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Batch {
    Apply,
    Remove,
}

pub struct App {
    config: Config,
    db: Database,
    bus: BusHandle,
}

impl App {
    pub async fn open(config: Config) -> Result<Self> {
        let db = Database::connect(&config.database.path).await.or_raise(|| ErrorKind::Store)?;
        let bus: BusHandle = Arc::new(BroadcastBus::new(config.progress.channel_capacity));
        Ok(Self { config, db, bus })
    }

    #[cfg(test)]
    fn database(&self) -> &Database {
        &self.db
    }

    /// Run one command. Returns `false` when it finished but something in it
    /// failed, such as a channel command in a batch.
    pub async fn run(&self, command: Command) -> Result<bool> {
        match command {
            Command::Changes(ChangesCommand::List { status }) => {
                self.list(parse_status(status.as_deref())?).await?;
                Ok(true)
            },
            Command::Changes(ChangesCommand::Apply { scope, yes }) => self.batch(Batch::Apply, &scope, yes).await,
            Command::Changes(ChangesCommand::Remove { scope }) => self.batch(Batch::Remove, &scope, false).await,
            Command::Covers(CoversCommand::Fetch { item_ids }) => {
                self.fetch_covers(&item_ids).await?;
                Ok(true)
            },
        }
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    async fn list(&self, status: Option<ChangeStatus>) -> Result<()> {
        let changes = ChangeRepository::from(&self.db).list(status).await.or_raise(|| ErrorKind::Store)?;
        let mut out = std::io::stdout().lock();
        for change in &changes {
            let line = serde_json::to_string(change).or_raise(|| ErrorKind::Output)?;
            writeln!(out, "{line}").or_raise(|| ErrorKind::Output)?;
        }
        Ok(())
    }

    fn coordinator(&self, channel: Channel) -> Arc<ProgressCoordinator> {
        let operation = channel.operation();
        let coordinator = ProgressCoordinator::new(operation, self.config.progress.enabled, self.bus.clone())
            .on_complete(move |stats| {
                tracing::info!(
                    operation,
                    total = stats.total,
                    processed = stats.processed,
                    skipped = stats.skipped,
                    errors = stats.errors,
                    "Operation complete"
                );
            })
            .on_error(move |reason| tracing::error!(operation, reason, "Operation failed"));
        Arc::new(coordinator)
    }

    async fn scope(&self, repo: &ChangeRepository, args: &ScopeArgs) -> Result<Scope> {
        match args.selection()? {
            Selection::Matching(filter) => Ok(Scope::Matching(filter)),
            Selection::Ids(ids) => {
                let mut changes = Vec::with_capacity(ids.len());
                for id in ids {
                    let change = repo
                        .get(&id)
                        .await
                        .or_raise(|| ErrorKind::Store)?
                        .ok_or_raise(|| ErrorKind::InvalidArgument(format!("unknown change {id}")))?;
                    changes.push(change);
                }
                Ok(Scope::Selected(changes))
            },
        }
    }

    async fn batch(&self, batch: Batch, args: &ScopeArgs, confirmed: bool) -> Result<bool> {
        let repo = ChangeRepository::from(&self.db);
        let scope = self.scope(&repo, args).await?;
        let mut options = args.options()?;
        if confirmed {
            options = options.confirmed();
        }

        let backend = Arc::new(SqliteChangeBackend::new(repo, Arc::new(LocalExecutor)).with_bus(self.bus.clone()));
        let mut ledger = Ledger::new(backend.clone())
            .with_catalog(Arc::new(LoggingCatalog))
            .with_refresh_policy(self.config.ledger.refresh);
        for channel in Channel::ALL {
            ledger = ledger.with_coordinator(channel, self.coordinator(channel));
        }

        let run = async {
            match batch {
                Batch::Apply => ledger.apply(&scope, options).await,
                Batch::Remove => ledger.remove(&scope, options).await,
            }
        };
        tokio::pin!(run);
        let report = tokio::select! {
            report = &mut run => report,
            _ = tokio::signal::ctrl_c() => {
                backend.cancel();
                run.await
            },
        }
        .or_raise(|| ErrorKind::Ledger)?;

        if batch == Batch::Apply {
            for channel in Channel::ALL {
                let Some(coordinator) = ledger.coordinator(channel) else {
                    continue;
                };
                if coordinator.is_enabled()
                    && matches!(report.channel(channel), ChannelOutcome::Settled { .. })
                    && let Err(err) = coordinator.settlement().wait_for(Option::is_some).await
                {
                    tracing::warn!(%channel, error = %err, "Progress coordinator went away");
                }
            }
        }
        log_report(&report);
        Ok(report.is_clean())
    }

    async fn fetch_covers(&self, item_ids: &[String]) -> Result<()> {
        let store = CoverStore::from(&self.db);
        let cache = AssetCache::spawn(Arc::new(store), self.config.assets.max_concurrent_fetches);
        cache.request_visible(item_ids);
        cache.idle().await;

        let mut out = std::io::stdout().lock();
        for id in item_ids {
            let line = match cache.get(id) {
                Some(handle) => json!({
                    "itemId": id,
                    "mimeType": handle.mime_type(),
                    "bytes": handle.bytes().map_or(0, <[u8]>::len),
                }),
                None => json!({ "itemId": id, "absent": true }),
            };
            writeln!(out, "{line}").or_raise(|| ErrorKind::Output)?;
        }
        drop(out);
        cache.shutdown().await;
        Ok(())
    }
}

fn log_report(report: &BatchReport) {
    for channel in Channel::ALL {
        match report.channel(channel) {
            ChannelOutcome::Skipped => {},
            ChannelOutcome::Settled { affected } => tracing::info!(%channel, affected, "Channel settled"),
            ChannelOutcome::Failed { message, failed } => {
                tracing::error!(%channel, reason = %message, failed, "Channel failed");
            },
        }
    }
    match &report.refresh {
        RefreshOutcome::Failed { message } => tracing::warn!(reason = %message, "Catalog refresh failed"),
        RefreshOutcome::Refreshed => tracing::debug!("Catalog refreshed"),
        RefreshOutcome::NotRequested | RefreshOutcome::NoCatalog => {},
    }
}
