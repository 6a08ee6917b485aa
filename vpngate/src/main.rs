mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Command};
use gateway_core::BootstrapError;
use shared_utils::config::Settings;
use shared_utils::logging::{LogOptions, init_logging};
use std::process::ExitCode;
use tracing::error;

fn exit_status(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("vpngate: {err}");
            return exit_status(BootstrapError::from(err).exit_code());
        }
    };
    if let Some(dir) = cli.data_dir {
        settings.data_dir = Some(dir);
    }

    let mut log = LogOptions::from_settings(&settings.log);
    if let Some(level) = cli.log_level {
        log.level = level.into();
    }
    log.json_format |= cli.json_logs;
    let _guard = init_logging(log);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Command::Run);
    match runtime.block_on(commands::dispatch(command, &settings)) {
        Ok(code) => exit_status(code),
        Err(err) => match err.downcast_ref::<BootstrapError>() {
            Some(known) => {
                error!(kind = known.kind(), "{known}");
                exit_status(known.exit_code())
            }
            None => {
                error!("{err:#}");
                ExitCode::FAILURE
            }
        },
    }
}
