// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The supervisor loop and the update strategy engine.
//!
//! The supervisor launches the wrapped application from the best installed
//! version as a child process and relaunches it whenever it exits with
//! [`MAGIC_EXIT_CODE`]. The re-launched child runs the real workload,
//! wrapped with a single background worker that checks for (and, depending
//! on strategy, installs) updates.

use std::{
    io,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    path::Path,
    process::Command,
    str::FromStr,
    sync::Arc,
    thread,
    time::Duration,
};

use crate::{non_empty_env, Error, ReleaseType, Result, UpdateInfo, Updater};

/// A child process exiting with this code asks the supervisor to re-evaluate
/// the installed versions and relaunch from the best one.
pub const MAGIC_EXIT_CODE: i32 = 126;

/// Delay before a background check when running concurrently with the
/// workload, so short-lived jobs are not raced by a download.
const CONCURRENT_CHECK_DELAY: Duration = Duration::from_secs(10);

/// When and how eagerly updates are handled around the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Check before the workload runs; never download.
    CheckBefore,
    /// Check concurrently with the workload; never download.
    CheckDuring,
    /// Check after the workload finished; never download.
    CheckAfter,
    /// Check and install before the workload runs.
    InstallBefore,
    /// Check and install concurrently with the workload.
    InstallDuring,
    /// Check and install after the workload finished.
    InstallAfter,
    /// Do nothing.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timing {
    Before,
    During,
    After,
    None,
}

/// The three orthogonal knobs a strategy decomposes into.
struct Plan {
    check: bool,
    download: bool,
    timing: Timing,
}

impl UpdateStrategy {
    fn plan(self) -> Plan {
        let (download, timing) = match self {
            Self::CheckBefore => (false, Timing::Before),
            Self::CheckDuring => (false, Timing::During),
            Self::CheckAfter => (false, Timing::After),
            Self::InstallBefore => (true, Timing::Before),
            Self::InstallDuring => (true, Timing::During),
            Self::InstallAfter => (true, Timing::After),
            Self::Never => (false, Timing::None),
        };
        Plan {
            check: self != Self::Never,
            download,
            timing,
        }
    }
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checkbefore" => Ok(Self::CheckBefore),
            "checkduring" => Ok(Self::CheckDuring),
            "checkafter" => Ok(Self::CheckAfter),
            "installbefore" => Ok(Self::InstallBefore),
            "installduring" => Ok(Self::InstallDuring),
            "installafter" => Ok(Self::InstallAfter),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown update strategy `{other}`")),
        }
    }
}

/// Launches the wrapped application from the most recent installed version
/// and supervises it, relaunching on [`MAGIC_EXIT_CODE`]. Returns the exit
/// code to terminate the process with.
///
/// Two environment switches short-circuit the supervisor: a truthy
/// `AUTOUPDATER_<APP>_SKIP_UPDATE` runs the workload directly, and a
/// populated `AUTOUPDATER_<APP>_INSTALL_ROOT` marks this process as the
/// re-launched child, which runs the workload wrapped with the strategy
/// from `AUTOUPDATER_<APP>_POLICY` (falling back to `default_strategy`).
pub fn run_from_most_recent<W>(
    updater: Updater,
    workload: W,
    args: &[String],
    default_strategy: UpdateStrategy,
) -> i32
where
    W: Fn(&[String]) -> i32,
{
    // transient re-spawn flag: observe, clear, back off
    let sleep_var = updater.env_name("SLEEP");
    if non_empty_env(&sleep_var).is_some() {
        std::env::remove_var(&sleep_var);
        thread::sleep(Duration::from_secs(10));
    }

    if env_flag(&updater.env_name("SKIP_UPDATE")) {
        return workload(args);
    }

    let updater = Arc::new(updater);

    if non_empty_env(&updater.env_name("INSTALL_ROOT")).is_some() {
        let strategy = non_empty_env(&updater.env_name("POLICY"))
            .and_then(|raw| match raw.parse() {
                Ok(strategy) => Some(strategy),
                Err(e) => {
                    log::warn!("{e}, using the default strategy");
                    None
                }
            })
            .unwrap_or(default_strategy);
        return run_wrapped(&updater, strategy, &workload, args);
    }

    loop {
        let best = updater.get_best_version(true);
        log::info!("launching {} from {}", best.version, best.folder.display());
        match spawn_child(&updater, &best.folder, args) {
            Ok(code) if code == MAGIC_EXIT_CODE => {
                log::info!("child requested a relaunch");
            }
            Ok(code) => return code,
            Err(e) => {
                updater.report_error(&e);
                // degrade to running the workload in this process
                return run_wrapped(&updater, default_strategy, &workload, args);
            }
        }
    }
}

/// Runs the workload with the update worker the strategy asks for. The
/// worker is always joined before this returns.
fn run_wrapped<W>(
    updater: &Arc<Updater>,
    strategy: UpdateStrategy,
    workload: &W,
    args: &[String],
) -> i32
where
    W: Fn(&[String]) -> i32,
{
    let plan = strategy.plan();

    let spawn_worker = || {
        let updater = Arc::clone(updater);
        let delayed = plan.timing == Timing::During;
        let download = plan.download;
        thread::spawn(move || -> (Option<UpdateInfo>, bool) {
            if delayed {
                thread::sleep(CONCURRENT_CHECK_DELAY);
            }
            let found = updater.check_for_update(ReleaseType::Unknown);
            let installed = match &found {
                Some(update) if download => updater.download_and_unpack(update),
                _ => false,
            };
            (found, installed)
        })
    };

    let mut worker = None;
    if plan.check && plan.timing != Timing::After {
        worker = Some(spawn_worker());
    }
    if plan.timing == Timing::Before {
        if let Some(handle) = worker.take() {
            log::info!("checking for updates before startup");
            report_worker_result(handle.join());
        }
    }

    let code = run_workload(updater, workload, args);

    if plan.check && plan.timing == Timing::After {
        worker = Some(spawn_worker());
    }
    if let Some(handle) = worker.take() {
        report_worker_result(handle.join());
    }

    code
}

fn report_worker_result(result: thread::Result<(Option<UpdateInfo>, bool)>) {
    match result {
        Ok((Some(update), true)) => log::info!(
            "update {} is installed and will be used on the next launch",
            update.version
        ),
        Ok((Some(update), false)) => log::info!("update {} is available", update.version),
        Ok((None, _)) => log::debug!("no update found"),
        Err(_) => log::error!("the update worker panicked"),
    }
}

/// Runs the workload, turning a panic into a crash log before re-raising it
/// so the hosting process still observes the original failure.
fn run_workload<W>(updater: &Updater, workload: &W, args: &[String]) -> i32
where
    W: Fn(&[String]) -> i32,
{
    match catch_unwind(AssertUnwindSafe(|| workload(args))) {
        Ok(code) => code,
        Err(payload) => {
            let message = panic_message(&payload);
            log::error!("the application crashed: {message}");
            write_crashlog(&updater.base_dir, &message);
            resume_unwind(payload)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    eprintln!(
        "DEBUG candidates: &str={} String={} Box<str>={} Cow={} fmt_args={}",
        payload.downcast_ref::<&str>().is_some(),
        payload.downcast_ref::<String>().is_some(),
        payload.downcast_ref::<Box<str>>().is_some(),
        payload.downcast_ref::<std::borrow::Cow<'static, str>>().is_some(),
        payload.downcast_ref::<std::fmt::Arguments>().is_some(),
    );
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn write_crashlog(base_dir: &Path, message: &str) {
    let path = base_dir.join("crashlog.txt");
    let body = format!("the application terminated abnormally\n\n{message}\n");
    if std::fs::write(&path, &body).is_err() {
        let fallback = std::env::temp_dir().join("crashlog.txt");
        let _ = std::fs::write(fallback, body);
    }
}

/// Spawns the application executable residing in `folder` with the original
/// arguments, marking it as a re-launched child. Returns its exit code.
fn spawn_child(updater: &Updater, folder: &Path, args: &[String]) -> Result<i32> {
    let exe_name = std::env::current_exe()?
        .file_name()
        .ok_or(Error::BaseDirNotFound)?
        .to_os_string();
    let exe = folder.join(exe_name);

    let mut cmd = Command::new(&exe);
    cmd.args(args)
        .current_dir(folder)
        .env(updater.env_name("INSTALL_ROOT"), &updater.base_dir);

    let status = wait_for_child(&mut cmd).map_err(|e| Error::Launch(exe, e))?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(not(windows))]
fn wait_for_child(cmd: &mut Command) -> io::Result<std::process::ExitStatus> {
    cmd.status()
}

// Console handles don't survive the spawn reliably on Windows, so the three
// standard streams are bridged explicitly: line-buffered stdin forwarding,
// byte copies for stdout and stderr.
#[cfg(windows)]
fn wait_for_child(cmd: &mut Command) -> io::Result<std::process::ExitStatus> {
    use std::io::{BufRead, Write};
    use std::process::Stdio;

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let mut child_in = child.stdin.take().expect("stdin was piped");
    // left running; it parks on the console until the next input line
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if child_in
                .write_all(line.as_bytes())
                .and_then(|_| child_in.write_all(b"\n"))
                .is_err()
            {
                break;
            }
        }
    });

    let mut child_out = child.stdout.take().expect("stdout was piped");
    let out = thread::spawn(move || {
        let _ = io::copy(&mut child_out, &mut io::stdout());
    });
    let mut child_err = child.stderr.take().expect("stderr was piped");
    let err = thread::spawn(move || {
        let _ = io::copy(&mut child_err, &mut io::stderr());
    });

    let status = child.wait()?;
    let _ = out.join();
    let _ = err.join();
    Ok(status)
}

fn env_flag(name: &str) -> bool {
    non_empty_env(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        })
        .unwrap_or(false)
}
