// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::process;

use adc_hub_rs::{
    cfg::{
        cli::{
            self, CliAction, CliArgs, EXIT_BAD_CONFIG, EXIT_PID_FILE, EXIT_UNKNOWN_ARG,
            USAGE,
        },
        config::HubConfig,
        logger::init_logger,
    },
    core::Core,
};
use anyhow::{Context, Result};
use tracing::info;

fn main() {
    let action = match cli::parse_args(std::env::args().skip(1)) {
        Ok(action) => action,
        Err(msg) => {
            eprintln!("{msg}");
            eprintln!("{USAGE}");
            process::exit(EXIT_UNKNOWN_ARG);
        }
    };

    match action {
        CliAction::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        CliAction::Help => println!("{USAGE}"),
        CliAction::Run(args) => run(args),
    }
}

fn run(args: CliArgs) -> ! {
    // Daemonise before the runtime exists; forking an async runtime is not
    // an option.
    if args.daemonize
        && let Err(code) = cli::daemonize()
    {
        eprintln!("failed to daemonize");
        process::exit(code);
    }

    if let Some(pid_file) = &args.pid_file
        && let Err(e) = cli::write_pid_file(pid_file)
    {
        eprintln!("failed to write pid file {pid_file:?}: {e}");
        process::exit(EXIT_PID_FILE);
    }

    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e:#}");
            process::exit(EXIT_BAD_CONFIG);
        }
    };

    let _log_guard = match init_logger(&cfg.log) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("logging disabled: {e:#}");
            None
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{e:#}");
            process::exit(EXIT_BAD_CONFIG);
        }
    };

    if let Err(e) = runtime.block_on(serve(cfg)) {
        eprintln!("{e:#}");
        process::exit(EXIT_BAD_CONFIG);
    }
    process::exit(cli::EXIT_OK);
}

fn load_config(args: &CliArgs) -> Result<HubConfig> {
    let config_dir = cli::resolve_config_path(&args.config_dir)?;
    HubConfig::load_from_file(config_dir.join("adchub.xml"))
}

async fn serve(cfg: HubConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        hub = %cfg.hub_name,
        "starting hub"
    );

    let running = Core::new(cfg).start().await?;
    let handle = running.handle().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });

    running.wait().await
}
