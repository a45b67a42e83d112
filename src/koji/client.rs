/*
 * depforge - Koji builds with automatic dependency resolution.
 * Copyright (C) 2025  depforge contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Thin synchronous adapter over the `koji` command-line client.
//!
//! Process spawning, stdout parsing, deadlines, and retries all live here
//! so the rest of the system stays hub-agnostic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::BuildStatus;
use crate::config::KojiConfig;
use crate::error::{BuildErrorKind, DepforgeError, DepforgeResult};

/// Default deadline for quick hub queries
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Submission retry policy: 3 attempts, exponential from 10 s
const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF: Duration = Duration::from_secs(10);

/// Flags accepted by a build submission
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    pub scratch: bool,
    pub nowait: bool,
}

/// Narrow capability surface of the build hub.
///
/// Everything the resolver and orchestrator need from Koji; test doubles
/// implement this instead of shelling out.
pub trait Hub: Send + Sync {
    /// Names of packages present in a tag
    fn list_packages(&self, tag: &str) -> DepforgeResult<BTreeSet<String>>;

    /// Whether a package is present in a tag
    fn package_exists(&self, name: &str, tag: &str) -> DepforgeResult<bool>;

    /// Mapping of package name to latest tagged NVR
    fn list_tagged_builds(&self, tag: &str) -> DepforgeResult<BTreeMap<String, String>>;

    /// Submit a build; returns the hub's task id
    fn submit_build(&self, target: &str, srpm: &Path, opts: SubmitOptions)
        -> DepforgeResult<u64>;

    /// Current status of a task
    fn task_status(&self, task_id: u64) -> DepforgeResult<BuildStatus>;

    /// Cancel a running task; true if the hub accepted the cancellation
    fn cancel_task(&self, task_id: u64) -> DepforgeResult<bool>;

    /// Block until the tag's repo has regenerated or the timeout elapses
    fn wait_for_repo(&self, tag: &str, timeout: Duration) -> DepforgeResult<bool>;

    /// Drop memoized tag listings so fresh builds become visible
    fn invalidate(&self);
}

/// Hub adapter shelling out to the `koji` CLI
pub struct KojiClient {
    server: String,
    cert: Option<PathBuf>,
    serverca: Option<PathBuf>,
    no_ssl_verify: bool,
    submit_backoff: Duration,
    tag_cache: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl KojiClient {
    pub fn new(config: &KojiConfig) -> Self {
        Self {
            server: config.server.clone(),
            cert: config.cert.clone(),
            serverca: config.serverca.clone(),
            no_ssl_verify: config.no_ssl_verify,
            submit_backoff: SUBMIT_BACKOFF,
            tag_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Latest source build NVR of a package in a tag
    pub fn latest_build(&self, tag: &str, package: &str) -> DepforgeResult<Option<String>> {
        let output = self.run_koji(
            &["latest-build", "--quiet", tag, package],
            COMMAND_TIMEOUT,
        )?;

        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|line| line.contains(package))
            .filter_map(|line| line.split_whitespace().next())
            .map(|nvr| nvr.to_string())
            .next())
    }

    /// Download the source RPM of a build into `dest`
    pub fn download_build(&self, nvr: &str, dest: &Path) -> DepforgeResult<()> {
        std::fs::create_dir_all(dest)
            .map_err(|e| DepforgeError::io(dest.display().to_string(), e))?;

        let output = self.run_koji_in(
            &["download-build", "--arch=src", nvr],
            Duration::from_secs(300),
            Some(dest),
        )?;

        if !output.status.success() {
            return Err(DepforgeError::SrpmNotFound {
                package: nvr.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    fn run_koji(&self, args: &[&str], timeout: Duration) -> DepforgeResult<Output> {
        self.run_koji_in(args, timeout, None)
    }

    /// Run a koji command with the configured connection flags and a
    /// hard deadline on the child process
    fn run_koji_in(
        &self,
        args: &[&str],
        timeout: Duration,
        cwd: Option<&Path>,
    ) -> DepforgeResult<Output> {
        let mut cmd = Command::new("koji");
        cmd.arg(format!("--server={}", self.server));

        if let Some(cert) = &self.cert {
            cmd.arg(format!("--cert={}", cert.display()));
        }
        if let Some(serverca) = &self.serverca {
            cmd.arg(format!("--serverca={}", serverca.display()));
        }

        cmd.args(args);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        if self.no_ssl_verify {
            cmd.env("PYTHONHTTPSVERIFY", "0");
            cmd.env("REQUESTS_CA_BUNDLE", "");
            cmd.env("CURL_CA_BUNDLE", "");
        }

        debug!("running: koji {}", args.join(" "));

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DepforgeError::koji_connection("koji command not found; install the koji client")
            } else {
                DepforgeError::koji_connection(format!("failed to spawn koji: {}", e))
            }
        })?;

        wait_with_deadline(child, timeout, args)
    }

    /// Retry a koji invocation on transient failures
    fn run_koji_retry(
        &self,
        args: &[&str],
        timeout: Duration,
        attempts: u32,
    ) -> DepforgeResult<Output> {
        let mut delay = self.submit_backoff;
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.run_koji(args, timeout) {
                Ok(output) => {
                    if output.status.success() {
                        return Ok(output);
                    }
                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    if !is_transient(&stderr) || attempt == attempts {
                        return Ok(output);
                    }
                    warn!(
                        "koji {} failed (attempt {}/{}): {}",
                        args.first().unwrap_or(&""),
                        attempt,
                        attempts,
                        stderr.trim()
                    );
                }
                Err(e) => {
                    if !e.is_retryable() || attempt == attempts {
                        return Err(e);
                    }
                    warn!("koji invocation failed (attempt {}/{}): {}", attempt, attempts, e);
                    last_err = Some(e);
                }
            }

            std::thread::sleep(delay);
            delay *= 2;
        }

        Err(last_err
            .unwrap_or_else(|| DepforgeError::koji_connection("retries exhausted".to_string())))
    }
}

impl Hub for KojiClient {
    fn list_packages(&self, tag: &str) -> DepforgeResult<BTreeSet<String>> {
        if let Some(cached) = self.tag_cache.lock().unwrap().get(tag) {
            return Ok(cached.clone());
        }

        let output = self.run_koji(
            &["list-pkgs", &format!("--tag={}", tag), "--quiet"],
            COMMAND_TIMEOUT,
        )?;

        if !output.status.success() {
            return Err(DepforgeError::koji_connection(format!(
                "failed to list packages in '{}': {}",
                tag,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let packages = parse_package_listing(&String::from_utf8_lossy(&output.stdout));
        info!("tag '{}' has {} packages", tag, packages.len());

        self.tag_cache
            .lock()
            .unwrap()
            .insert(tag.to_string(), packages.clone());
        Ok(packages)
    }

    fn package_exists(&self, name: &str, tag: &str) -> DepforgeResult<bool> {
        if self.list_packages(tag)?.contains(name) {
            return Ok(true);
        }

        // The listing is memoized; probe directly for builds tagged since
        let output = self.run_koji(
            &["list-tagged", tag, "--package", name, "--quiet"],
            COMMAND_TIMEOUT,
        )?;
        Ok(output.status.success() && !output.stdout.is_empty())
    }

    fn list_tagged_builds(&self, tag: &str) -> DepforgeResult<BTreeMap<String, String>> {
        let output = self.run_koji(&["list-tagged", tag, "--quiet"], COMMAND_TIMEOUT)?;

        if !output.status.success() {
            return Err(DepforgeError::koji_connection(format!(
                "failed to list builds in '{}': {}",
                tag,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_tagged_builds(&String::from_utf8_lossy(&output.stdout)))
    }

    fn submit_build(
        &self,
        target: &str,
        srpm: &Path,
        opts: SubmitOptions,
    ) -> DepforgeResult<u64> {
        let srpm_str = srpm.display().to_string();
        let mut args = vec!["build"];
        if opts.scratch {
            args.push("--scratch");
        }
        if opts.nowait {
            args.push("--nowait");
        }
        args.push(target);
        args.push(&srpm_str);

        let timeout = if opts.nowait {
            COMMAND_TIMEOUT
        } else {
            Duration::from_secs(3600)
        };

        let output = self.run_koji_retry(&args, timeout, SUBMIT_ATTEMPTS)?;

        if !output.status.success() {
            return Err(DepforgeError::KojiBuild {
                package: srpm_str,
                kind: BuildErrorKind::SubmitFailed,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_task_id(&stdout).ok_or_else(|| DepforgeError::KojiBuild {
            package: srpm_str,
            kind: BuildErrorKind::SubmitFailed,
            detail: "could not parse task id from koji output".to_string(),
        })
    }

    fn task_status(&self, task_id: u64) -> DepforgeResult<BuildStatus> {
        let output = self.run_koji(&["taskinfo", &task_id.to_string()], COMMAND_TIMEOUT)?;

        if !output.status.success() {
            return Ok(BuildStatus::Failed);
        }

        Ok(parse_taskinfo_status(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    fn cancel_task(&self, task_id: u64) -> DepforgeResult<bool> {
        let output = self.run_koji(&["cancel", &task_id.to_string()], COMMAND_TIMEOUT)?;
        Ok(output.status.success())
    }

    fn wait_for_repo(&self, tag: &str, timeout: Duration) -> DepforgeResult<bool> {
        info!("waiting for repo regeneration: {}", tag);

        let output = self.run_koji(
            &[
                "wait-repo",
                tag,
                &format!("--timeout={}", timeout.as_secs()),
            ],
            timeout + Duration::from_secs(60),
        )?;

        if !output.status.success() {
            warn!(
                "wait-repo failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(false);
        }

        info!("repo regenerated for '{}'", tag);
        Ok(true)
    }

    fn invalidate(&self) {
        self.tag_cache.lock().unwrap().clear();
    }
}

/// Wait for a child process, killing it when the deadline passes
fn wait_with_deadline(
    mut child: std::process::Child,
    timeout: Duration,
    args: &[&str],
) -> DepforgeResult<Output> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                return child
                    .wait_with_output()
                    .map_err(|e| DepforgeError::koji_connection(format!("wait failed: {}", e)));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(DepforgeError::koji_connection(format!(
                        "koji command timed out: {}",
                        args.join(" ")
                    )));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(DepforgeError::koji_connection(format!(
                    "failed to poll koji process: {}",
                    e
                )));
            }
        }
    }
}

/// Failures that a retry has a chance of fixing
fn is_transient(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    if lower.contains("auth") || lower.contains("no such") || lower.contains("not found") {
        return false;
    }
    true
}

/// First whitespace-delimited token of each line is a package name
fn parse_package_listing(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| name.to_string())
        .collect()
}

/// `list-tagged --quiet` lines start with the NVR
fn parse_tagged_builds(stdout: &str) -> BTreeMap<String, String> {
    let mut builds = BTreeMap::new();

    for line in stdout.lines() {
        let Some(nvr) = line.split_whitespace().next() else {
            continue;
        };
        if let Some(name) = nvr_name(nvr) {
            builds.insert(name, nvr.to_string());
        }
    }

    builds
}

/// Strip version and release off an NVR
fn nvr_name(nvr: &str) -> Option<String> {
    let mut parts: Vec<&str> = nvr.rsplitn(3, '-').collect();
    if parts.len() < 3 {
        return None;
    }
    parts.reverse();
    Some(parts[0].to_string())
}

/// Extract the task id from `koji build` output
fn parse_task_id(stdout: &str) -> Option<u64> {
    for line in stdout.lines() {
        if line.contains("Created task:") {
            if let Some(id) = line.rsplit(':').next().and_then(|s| s.trim().parse().ok()) {
                return Some(id);
            }
        }
        if line.contains("Task info:") {
            if let Some(id) = line.rsplit('=').next().and_then(|s| s.trim().parse().ok()) {
                return Some(id);
            }
        }
    }
    None
}

/// Map `koji taskinfo` output to a task status
fn parse_taskinfo_status(stdout: &str) -> BuildStatus {
    let lower = stdout.to_lowercase();

    if lower.contains("closed") || lower.contains("complete") {
        BuildStatus::Complete
    } else if lower.contains("failed") {
        BuildStatus::Failed
    } else if lower.contains("canceled") {
        BuildStatus::Canceled
    } else if lower.contains("open") || lower.contains("free") || lower.contains("assigned") {
        BuildStatus::Building
    } else {
        BuildStatus::Pending
    }
}
