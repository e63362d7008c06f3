//! lbard — Low-Bandwidth Asynchronous Rhizome Demonstrator.
//!
//! Syncs a content-addressed Rhizome bundle store between nearby nodes over
//! HF/ALE and other tiny, lossy, declarative radio transports. Run
//! `lbard --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

mod cli;
mod color;
mod config;
mod run;
mod service;
mod status;

use cli::{Cli, Commands, ServiceAction};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (except for `init`, which doesn't need one).
    let config = match &cli.command {
        Commands::Init => None,
        _ => {
            if !cli.config.exists() {
                let example = config::LbardConfig::default_example();
                std::fs::write(&cli.config, toml::to_string_pretty(&example)?)?;
                eprintln!(
                    "Created '{}' with example settings — edit it before running `lbard run`.",
                    cli.config.display()
                );
            }
            Some(config::LbardConfig::load(&cli.config)?)
        }
    };

    // The debug side channel (C12) mirrors every log line to a file under
    // `debug.log_dir` in addition to the normal stderr output, so a run
    // under systemd can be inspected after the fact without journalctl.
    let _file_guard = match config.as_ref().map(|c| &c.debug) {
        Some(debug) if debug.log_registrations => {
            std::fs::create_dir_all(&debug.log_dir)?;
            let file_appender = tracing_appender::rolling::never(&debug.log_dir, "lbard-rhizome.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(EnvFilter::from_default_env().add_directive("info".parse()?))
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_filter(EnvFilter::new("debug")),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(EnvFilter::from_default_env().add_directive("info".parse()?))
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    };

    match cli.command {
        Commands::Init => {
            let example = config::LbardConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run => {
            run::run(config.as_ref().unwrap())?;
        }
        Commands::Status => {
            status::run(config.as_ref().unwrap())?;
        }
        Commands::Service { action } => match action {
            ServiceAction::Install => service::install(&cli.config)?,
            ServiceAction::Uninstall => service::uninstall()?,
            ServiceAction::Start => service::control("start")?,
            ServiceAction::Stop => service::control("stop")?,
            ServiceAction::Restart => service::control("restart")?,
        },
    }

    Ok(())
}
