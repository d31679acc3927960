// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const EXIT_OK: i32 = 0;
pub const EXIT_PID_FILE: i32 = 1;
pub const EXIT_BAD_CONFIG: i32 = 2;
pub const EXIT_UNKNOWN_ARG: i32 = 4;
pub const EXIT_DAEMON_FORK: i32 = 5;
pub const EXIT_DAEMON_SETSID: i32 = 6;
pub const EXIT_DAEMON_REFORK: i32 = 7;

pub const USAGE: &str = "Usage: adchubd [-c <configdir>] [-d] [-p <pidfile>] [-v] [-h]
  -c <configdir>  directory holding adchub.xml (default: .)
  -d              detach and run as a daemon (POSIX only)
  -p <pidfile>    write the process id to this file
  -v              print version and exit
  -h              print this help and exit";

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_dir: PathBuf,
    pub daemonize: bool,
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum CliAction {
    Run(CliArgs),
    Version,
    Help,
}

/// Parses the daemon's arguments. Unknown parameters are an error the
/// caller turns into exit code [`EXIT_UNKNOWN_ARG`].
pub fn parse_args<I>(args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = CliArgs {
        config_dir: PathBuf::from("."),
        daemonize: false,
        pid_file: None,
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" => {
                let value = args.next().ok_or("-c requires a directory argument")?;
                out.config_dir = PathBuf::from(value);
            }
            "-p" => {
                let value = args.next().ok_or("-p requires a file argument")?;
                out.pid_file = Some(PathBuf::from(value));
            }
            "-d" => out.daemonize = true,
            "-v" => return Ok(CliAction::Version),
            "-h" => return Ok(CliAction::Help),
            other => return Err(format!("unknown parameter: {other}")),
        }
    }
    Ok(CliAction::Run(out))
}

pub fn resolve_config_path(rel: &Path) -> Result<PathBuf> {
    let abs = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(rel)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, std::process::id().to_string())
}

/// Classic double-fork daemonisation. On failure returns the exit code the
/// host should terminate with.
#[cfg(unix)]
pub fn daemonize() -> Result<(), i32> {
    match unsafe { libc::fork() } {
        -1 => return Err(EXIT_DAEMON_FORK),
        0 => {}
        _ => std::process::exit(EXIT_OK),
    }
    if unsafe { libc::setsid() } == -1 {
        return Err(EXIT_DAEMON_SETSID);
    }
    match unsafe { libc::fork() } {
        -1 => return Err(EXIT_DAEMON_REFORK),
        0 => {}
        _ => std::process::exit(EXIT_OK),
    }

    let _ = std::env::set_current_dir("/");
    unsafe {
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> Result<(), i32> {
    Err(EXIT_DAEMON_FORK)
}
