//! Admin CLI surface (§6): `poll`/`renew-watch`/`reset-cursor`/
//! `suspend`/`resume` plus `serve`, the long-running daemon. Defined
//! with `clap::Parser` derive rather than hand-rolled `env::args()`
//! parsing.

use clap::{Parser, Subcommand, ValueEnum};
use sunnycore_core::Source;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "sunnycored", about = "Ingestion daemon and admin CLI for sunnycore")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the background sync daemon: Scheduler tick loop, Poller,
    /// and Watch Manager renewal sweep.
    Serve,

    /// Force an immediate poll tick for (user, source), bypassing the
    /// Scheduler's adaptive cadence.
    Poll {
        user: Uuid,
        #[arg(value_enum)]
        source: SourceArg,
    },

    /// Force a Watch renewal for (user, source), regardless of expiry.
    RenewWatch {
        user: Uuid,
        #[arg(value_enum)]
        source: SourceArg,
    },

    /// Clear the stored history token so the next poll re-scans recent
    /// history instead of resuming from the old cursor.
    ResetCursor {
        user: Uuid,
        #[arg(value_enum)]
        source: SourceArg,
    },

    /// Suspend scheduled polling for every source of this user.
    Suspend { user: Uuid },

    /// Resume scheduled polling for every source of this user.
    Resume { user: Uuid },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[value(rename_all = "lower")]
pub enum SourceArg {
    Mail,
    Drive,
    Calendar,
}

impl From<SourceArg> for Source {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Mail => Source::Mail,
            SourceArg::Drive => Source::Drive,
            SourceArg::Calendar => Source::Calendar,
        }
    }
}
