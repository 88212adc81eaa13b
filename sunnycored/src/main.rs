use clap::Parser;

use sunnycored::cli::{Cli, Command};

fn main() -> std::process::ExitCode {
    sunnycored::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => sunnycored::serve(),
        Command::Poll { user, source } => sunnycored::poll(user, source.into()),
        Command::RenewWatch { user, source } => sunnycored::renew_watch(user, source.into()),
        Command::ResetCursor { user, source } => sunnycored::reset_cursor(user, source.into()),
        Command::Suspend { user } => sunnycored::suspend(user),
        Command::Resume { user } => sunnycored::resume(user),
    }
}
