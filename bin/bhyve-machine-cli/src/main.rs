// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bhyve_machine::driver::SparseDiskBuilder;
use bhyve_machine::{
    Boot2DockerDriver, Completion, ConsoleRetry, Driver, MachineParams,
};
use bhyve_machine_config::Config;
use clap::{Parser, Subcommand};
use slog::{o, Drain, Level, Logger};

/// How long to wait for runtime tasks at exit. A console reader parked in a
/// blocking read cannot be cancelled, so it is abandoned after this.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Boot and supervise a boot2docker VM under bhyve using grub-bhyve
struct Opt {
    /// Machine configuration file
    #[clap(action)]
    config: PathBuf,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that this process is privileged enough to run the VM
    Preflight,

    /// Create the machine's disk image, then boot it
    Create {
        /// Attach to the VM's serial console once it appears
        #[clap(long, action)]
        console: bool,
    },

    /// Boot the machine
    Start {
        /// Attach to the VM's serial console once it appears
        #[clap(long, action)]
        console: bool,
    },

    /// Write the device map and GRUB configuration, without booting
    WriteBootFiles,
}

/// Create a top-level logger that outputs to stderr
fn create_logger(debug: bool) -> (Logger, slog_async::AsyncGuard) {
    let level = if debug { Level::Debug } else { Level::Info };
    let (drain, guard) = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog::LevelFilter(drain, level).fuse();
        slog_async::Async::new(drain).build_with_guard()
    } else {
        let drain = slog_bunyan::with_name("bhyve-machine", std::io::stderr())
            .build()
            .fuse();
        let drain = slog::LevelFilter(drain, level).fuse();
        slog_async::Async::new(drain).build_with_guard()
    };
    (Logger::root(drain.fuse(), o!()), guard)
}

fn machine_params(config: &Config) -> MachineParams {
    let m = &config.machine;
    MachineParams {
        machine_name: m.name.clone(),
        store_path: m.store_path.clone(),
        vm_name: m.vm_name.clone(),
        boot2docker_url: m.boot2docker_url.clone(),
        disk_size: m.disk_size,
        bootloader: m.bootloader.clone(),
    }
}

fn console_retry(config: &bhyve_machine_config::Console) -> ConsoleRetry {
    ConsoleRetry {
        interval: Duration::from_millis(config.retry_interval_ms),
        max_attempts: config.max_attempts,
        timeout: config.timeout_ms.map(Duration::from_millis),
        permission_denied_is_fatal: config.permission_denied_is_fatal,
    }
}

/// Copy the VM's console to stdout until either side goes away.
fn spawn_console(
    driver: &Boot2DockerDriver,
    retry: ConsoleRetry,
    log: &Logger,
) -> tokio::task::JoinHandle<()> {
    let state_dir = driver.layout().state_dir.clone();
    let log = log.new(o!("component" => "console"));
    tokio::spawn(async move {
        let fp = match bhyve_machine::console::open_console(
            &state_dir, &retry, &log,
        )
        .await
        {
            Ok(fp) => fp,
            Err(e) => {
                slog::error!(log, "{:#}", anyhow::Error::from(e));
                return;
            }
        };
        copy_console(fp, &log).await
    })
}

async fn copy_console(fp: std::fs::File, log: &Logger) {
    let mut console = tokio::fs::File::from_std(fp);
    let mut stdout = tokio::io::stdout();
    match tokio::io::copy(&mut console, &mut stdout).await {
        Ok(n) => slog::info!(log, "console closed"; "bytes" => n),
        Err(e) => slog::error!(log, "console copy failed"; "error" => %e),
    }
}

/// Shut the runtime down without waiting on blocking-pool reads.
fn shutdown_runtime(rt: tokio::runtime::Runtime) {
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
}

/// Wait for the bootloader to exit, relaying Ctrl-C to it as SIGTERM.
///
/// Returns the exit code this process should report.
async fn supervise(
    driver: &Boot2DockerDriver,
    mut done: Completion,
    console: Option<ConsoleRetry>,
    log: &Logger,
) -> anyhow::Result<i32> {
    let instance = driver.instance().context("no VM instance after start")?;

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to register Ctrl-C signal handler.")?;

    let console_task = console.map(|retry| spawn_console(driver, retry, log));

    let res = loop {
        tokio::select! {
            res = &mut done => break res,
            Some(()) = stop_rx.recv() => {
                slog::info!(log, "Stopping VM...");
                if let Err(e) = instance.signal(libc::SIGTERM) {
                    slog::warn!(log, "failed to signal bootloader";
                        "error" => %e);
                }
            }
        }
    };

    if let Some(task) = console_task {
        task.abort();
    }

    Ok(match res {
        Ok(status) => {
            slog::info!(log, "VM exited"; "status" => %status);
            match (status.code(), status.signal()) {
                (Some(code), _) => code,
                (None, Some(sig)) => 128 + sig,
                (None, None) => 1,
            }
        }
        Err(e) => {
            slog::error!(log, "lost track of VM"; "error" => %e);
            1
        }
    })
}

async fn run(opt: Opt, config: Config, log: &Logger) -> anyhow::Result<i32> {
    let mut driver = Boot2DockerDriver::new(
        machine_params(&config),
        Box::new(SparseDiskBuilder),
        log,
    );
    let retry = console_retry(&config.console);

    match opt.cmd {
        Command::Preflight => {
            driver.preflight_check()?;
            slog::info!(log, "preflight check passed");
            Ok(0)
        }
        Command::WriteBootFiles => {
            driver.prepare_boot_files()?;
            Ok(0)
        }
        Command::Create { console } => {
            driver.preflight_check()?;
            let done = driver.create()?;
            supervise(&driver, done, console.then_some(retry), log).await
        }
        Command::Start { console } => {
            driver.preflight_check()?;
            let done = driver.start()?;
            supervise(&driver, done, console.then_some(retry), log).await
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let config = bhyve_machine_config::parse(&opt.config).with_context(|| {
        format!("reading config {}", opt.config.display())
    })?;

    let (log, log_guard) = create_logger(opt.debug);

    // Create tokio runtime, we don't use the tokio::main macro so the log
    // guard can be flushed before picking an exit code
    let rt =
        tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let code = rt.block_on(run(opt, config, &log));
    shutdown_runtime(rt);

    let code = match code {
        Ok(code) => code,
        Err(e) => {
            slog::error!(log, "{:#}", e);
            1
        }
    };
    drop(log);
    drop(log_guard);
    std::process::exit(code);
}
