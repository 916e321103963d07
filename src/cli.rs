//! Command-line definitions.

use crate::error::{ErrorKind, Result};
use clap::{Args, Parser, Subcommand};
use exn::ResultExt;
use folio_ledger::{BatchOptions, ChangeFilter, ChangeStatus, RefreshPolicy};
use std::path::PathBuf;
use std::str::FromStr;

/// Review and apply staged library changes.
#[derive(Debug, Parser)]
#[command(name = "folio", version, about)]
pub struct Cli {
    /// Config file merged over the user config (TOML, YAML or JSON).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Staged changes.
    #[command(subcommand)]
    Changes(ChangesCommand),
    /// Cover images.
    #[command(subcommand)]
    Covers(CoversCommand),
}

#[derive(Debug, Subcommand)]
pub enum ChangesCommand {
    /// Print changes as JSON lines, oldest first.
    List {
        /// Only changes with this status: pending, applied or error.
        #[arg(long)]
        status: Option<String>,
    },
    /// Apply pending changes.
    Apply {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Confirm a batch that deletes files.
        #[arg(long, short)]
        yes: bool,
    },
    /// Discard pending changes without applying them.
    Remove {
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum CoversCommand {
    /// Resolve covers for the given items and report what was found.
    Fetch {
        #[arg(required = true, value_name = "ITEM_IDS")]
        item_ids: Vec<String>,
    },
}

#[derive(Debug, Args)]
pub struct ScopeArgs {
    /// Change ids to act on.
    #[arg(value_name = "IDS", conflicts_with = "all")]
    pub ids: Vec<String>,
    /// Act on every pending change matching --channel and --device.
    #[arg(long)]
    pub all: bool,
    /// Restrict --all to one channel: file or device.
    #[arg(long, requires = "all")]
    pub channel: Option<String>,
    /// Restrict --all to one device's changes.
    #[arg(long, requires = "all")]
    pub device: Option<String>,
    /// Catalog refresh afterwards: never, sync or always.
    #[arg(long)]
    pub refresh: Option<String>,
}

/// What a scope argument set selects, before any ids are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Ids(Vec<String>),
    Matching(ChangeFilter),
}

impl ScopeArgs {
    pub fn selection(&self) -> Result<Selection> {
        if self.all {
            let mut filter = ChangeFilter::default();
            if let Some(channel) = &self.channel {
                filter = filter.channel(parse(channel, "channel")?);
            }
            if let Some(device) = &self.device {
                filter = filter.device(device);
            }
            return Ok(Selection::Matching(filter));
        }
        if self.ids.is_empty() {
            exn::bail!(ErrorKind::InvalidArgument("pass change ids or --all".to_string()));
        }
        Ok(Selection::Ids(self.ids.clone()))
    }

    pub fn options(&self) -> Result<BatchOptions> {
        let mut options = BatchOptions::default();
        if let Some(refresh) = &self.refresh {
            options = options.refresh(parse::<RefreshPolicy>(refresh, "refresh")?);
        }
        Ok(options)
    }
}

pub fn parse_status(status: Option<&str>) -> Result<Option<ChangeStatus>> {
    status.map(|status| parse(status, "status")).transpose()
}

fn parse<T>(value: &str, flag: &str) -> Result<T>
where
    T: FromStr<Err = folio_ledger::error::Error>,
{
    T::from_str(value).or_raise(|| ErrorKind::InvalidArgument(format!("--{flag} {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_ledger::Channel;
    use rstest::rstest;

    fn scope(args: &[&str]) -> ScopeArgs {
        let argv = ["folio", "changes", "remove"].iter().chain(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Changes(ChangesCommand::Remove { scope }) => scope,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_explicit_ids() {
        let scope = scope(&["c1", "c2"]);
        assert_eq!(scope.selection().unwrap(), Selection::Ids(vec!["c1".to_string(), "c2".to_string()]));
        assert_eq!(scope.options().unwrap().refresh, None);
    }

    #[rstest]
    #[case(&["--all"], ChangeFilter::default())]
    #[case(&["--all", "--channel", "file"], ChangeFilter::default().channel(Channel::File))]
    #[case(&["--all", "--device", "kobo"], ChangeFilter::default().device("kobo"))]
    fn test_wildcard(#[case] args: &[&str], #[case] expected: ChangeFilter) {
        assert_eq!(scope(args).selection().unwrap(), Selection::Matching(expected));
    }

    #[test]
    fn test_refresh_policy() {
        let options = scope(&["--all", "--refresh", "always"]).options().unwrap();
        assert_eq!(options.refresh, Some(RefreshPolicy::Always));
        let err = scope(&["--all", "--refresh", "sometimes"]).options().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(message) if message == "--refresh sometimes"));
    }

    #[rstest]
    #[case(&[])]
    #[case(&["--all", "--channel", "printer"])]
    fn test_invalid_selection(#[case] args: &[&str]) {
        assert!(scope(args).selection().is_err());
    }

    #[rstest]
    #[case(&["folio", "changes", "apply", "c1", "--all"])]
    #[case(&["folio", "changes", "apply", "--channel", "file"])]
    #[case(&["folio", "covers", "fetch"])]
    fn test_rejected_by_parser(#[case] argv: &[&str]) {
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_status_and_global_config() {
        let cli = Cli::try_parse_from(["folio", "changes", "list", "--status", "error", "--config", "f.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("f.toml")));
        let Command::Changes(ChangesCommand::List { status }) = cli.command else {
            panic!("expected changes list");
        };
        assert_eq!(parse_status(status.as_deref()).unwrap(), Some(ChangeStatus::Error));
        assert!(parse_status(Some("archived")).is_err());
    }
}
