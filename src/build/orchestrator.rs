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

//! Orchestrates builds level by level over the dependency DAG.
//!
//! Each level's packages are submitted through a bounded worker pool and
//! polled to a terminal state; the repo is regenerated between levels and
//! the root is always submitted last, alone.

use console::style;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{BuildErrorKind, DepforgeError, DepforgeResult};
use crate::fetch::SrpmFetcher;
use crate::koji::{BuildStatus, Hub, SubmitOptions};
use crate::resolve::{DependencyGraph, DependencyResolver, NameResolver};
use crate::spec::{srpm, PackageInfo};

/// One submitted (or about-to-be-submitted) build
#[derive(Debug, Clone)]
pub struct BuildTask {
    pub package_name: String,
    pub srpm_path: PathBuf,
    pub target: String,
    pub task_id: Option<u64>,
    pub status: BuildStatus,
    pub error_message: Option<String>,
    pub nvr: Option<String>,
}

impl BuildTask {
    fn new(package_name: &str, srpm_path: &Path, target: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            srpm_path: srpm_path.to_path_buf(),
            target: target.to_string(),
            task_id: None,
            status: BuildStatus::Pending,
            error_message: None,
            nvr: None,
        }
    }
}

/// Outcome of an orchestrated build run
#[derive(Debug, Default)]
pub struct BuildResult {
    pub success: bool,
    pub tasks: Vec<BuildTask>,
    pub built_packages: Vec<String>,
    pub failed_packages: Vec<String>,
    pub total_seconds: f64,
}

impl BuildResult {
    /// Derive success and the built/failed lists from the tasks
    fn finalize(mut self, started: Instant) -> Self {
        self.built_packages = self
            .tasks
            .iter()
            .filter(|t| t.status == BuildStatus::Complete)
            .map(|t| t.package_name.clone())
            .collect();
        self.failed_packages = self
            .tasks
            .iter()
            .filter(|t| t.status != BuildStatus::Complete)
            .map(|t| t.package_name.clone())
            .collect();
        self.success = self.failed_packages.is_empty();
        self.total_seconds = started.elapsed().as_secs_f64();
        self
    }
}

/// Timing and mode knobs for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub scratch: bool,
    pub no_wait: bool,
    pub max_parallel: usize,
    pub repo_timeout: Duration,
    pub task_timeout: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            scratch: false,
            no_wait: false,
            max_parallel: 4,
            repo_timeout: Duration::from_secs(1800),
            task_timeout: Duration::from_secs(3600),
            poll_initial: Duration::from_secs(5),
            poll_max: Duration::from_secs(60),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scratch: config.build.scratch,
            no_wait: config.build.no_wait,
            max_parallel: config.build.max_parallel_per_level,
            repo_timeout: Duration::from_secs(config.build.repo_timeout_secs),
            task_timeout: Duration::from_secs(config.build.task_timeout_secs),
            ..Default::default()
        }
    }
}

/// Drives dependency-resolved builds through the hub
pub struct BuildOrchestrator {
    hub: Arc<dyn Hub>,
    fetcher: Arc<SrpmFetcher>,
    names: Arc<NameResolver>,
    target: String,
    build_tag: String,
    opts: OrchestratorOptions,
    cancel: Arc<AtomicBool>,
}

impl BuildOrchestrator {
    pub fn new(
        hub: Arc<dyn Hub>,
        fetcher: Arc<SrpmFetcher>,
        names: Arc<NameResolver>,
        target: &str,
        build_tag: &str,
        opts: OrchestratorOptions,
    ) -> Self {
        Self {
            hub,
            fetcher,
            names,
            target: target.to_string(),
            build_tag: build_tag.to_string(),
            opts,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked before every submission; wire this to Ctrl-C
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Resolve the dependency graph for a root SRPM
    pub async fn resolve_graph(
        &self,
        info: &PackageInfo,
        srpm_path: &Path,
    ) -> DepforgeResult<DependencyGraph> {
        let resolver = DependencyResolver::new(&self.names);

        let hub = self.hub.clone();
        let build_tag = self.build_tag.clone();
        let available = move |name: &str| hub.package_exists(name, &build_tag);

        let requires_of = |path: &Path| srpm::build_requires(path);

        let fetcher = self.fetcher.clone();
        let mut fetch = move |name: &str| {
            let fetcher = fetcher.clone();
            let name = name.to_string();
            async move { fetcher.fetch(&name, None).await }.boxed()
        };

        resolver
            .build_graph(&info.name, srpm_path, &available, &requires_of, &mut fetch)
            .await
    }

    /// Build a package with automatic dependency resolution.
    ///
    /// Analyzes the SRPM, resolves and fetches missing dependencies,
    /// levels the DAG, builds each level through the hub with a repo
    /// regeneration in between, and submits the root last.
    pub async fn build_with_deps(&self, srpm_path: &Path) -> DepforgeResult<BuildResult> {
        let started = Instant::now();

        let info = srpm::package_info(srpm_path)?;
        info!("building {} with dependency resolution", info.nvr());

        let mut graph = self.resolve_graph(&info, srpm_path).await?;
        let chain = graph.build_chain()?;

        let total: usize = chain.iter().map(|level| level.len()).sum();
        println!(
            "{} {} package(s) to build in {} level(s)",
            style("::").cyan().bold(),
            total,
            chain.len()
        );

        Ok(self
            .execute_chain(&graph, &chain, &info, srpm_path, started)
            .await)
    }

    /// Run a leveled plan to completion.
    ///
    /// Dependency levels run through the worker pool; a level failure
    /// cancels its running siblings and stops the run. The root is
    /// submitted only after every level completed and the repo caught up.
    pub async fn execute_chain(
        &self,
        graph: &DependencyGraph,
        chain: &[Vec<String>],
        root_info: &PackageInfo,
        root_srpm: &Path,
        started: Instant,
    ) -> BuildResult {
        let mut result = BuildResult::default();

        let dependency_levels = chain.len().saturating_sub(1);

        for (index, level) in chain.iter().take(dependency_levels).enumerate() {
            println!(
                "{} level {}/{}: {}",
                style("::").cyan().bold(),
                index + 1,
                dependency_levels,
                level.join(", ")
            );

            let mut batch = Vec::new();
            for name in level {
                if name == &root_info.name {
                    continue;
                }
                match graph.get(name).and_then(|n| n.srpm_path.clone()) {
                    Some(srpm) => batch.push((name.clone(), srpm)),
                    None => warn!("skipping {}: no SRPM available", name),
                }
            }

            let tasks = self.build_level(batch).await;
            let level_ok = tasks.iter().all(|t| t.status == BuildStatus::Complete);
            result.tasks.extend(tasks);

            if !level_ok {
                error!("level {} failed; not attempting higher levels", index + 1);
                return result.finalize(started);
            }

            let hub = self.hub.clone();
            let tag = self.build_tag.clone();
            let timeout = self.opts.repo_timeout;
            let regenerated = tokio::task::spawn_blocking(move || hub.wait_for_repo(&tag, timeout))
                .await
                .unwrap_or_else(|e| Err(DepforgeError::koji_connection(e.to_string())));
            match regenerated {
                Ok(true) => {}
                Ok(false) => warn!("repo regeneration timed out; continuing"),
                Err(e) => warn!("wait-repo failed: {}", e),
            }

            // The tag just grew new builds
            self.hub.invalidate();
        }

        // The root build
        if self.cancel.load(Ordering::SeqCst) {
            let mut task = BuildTask::new(&root_info.name, root_srpm, &self.target);
            task.status = BuildStatus::Canceled;
            task.error_message = Some("canceled before submission".to_string());
            result.tasks.push(task);
            return result.finalize(started);
        }

        println!(
            "{} building target package {}",
            style("::").cyan().bold(),
            style(&root_info.nvr()).yellow().bold()
        );

        let mut root_task = self
            .run_one(root_info.name.clone(), root_srpm.to_path_buf(), self.opts.no_wait)
            .await;
        root_task.nvr = Some(root_info.nvr());
        let submitted_only = self.opts.no_wait && root_task.status == BuildStatus::Building;
        result.tasks.push(root_task);

        let mut result = result.finalize(started);
        if submitted_only {
            // Submit-and-return mode: a root left BUILDING is not a failure
            result.failed_packages.retain(|p| p != &root_info.name);
            result.built_packages.push(root_info.name.clone());
            result.success = result.failed_packages.is_empty();
        }
        result
    }

    /// Submit one level through the bounded worker pool and await all
    /// terminal states
    async fn build_level(&self, batch: Vec<(String, PathBuf)>) -> Vec<BuildTask> {
        if batch.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.opts.max_parallel));
        let stop = Arc::new(AtomicBool::new(false));
        let mut join_set: JoinSet<BuildTask> = JoinSet::new();

        for (name, srpm) in batch {
            let hub = self.hub.clone();
            let semaphore = semaphore.clone();
            let stop = stop.clone();
            let cancel = self.cancel.clone();
            let target = self.target.clone();
            let opts = self.opts.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                tokio::task::spawn_blocking(move || {
                    let mut task = BuildTask::new(&name, &srpm, &target);
                    run_build(hub.as_ref(), &mut task, &opts, false, &stop, &cancel);
                    if task.status != BuildStatus::Complete {
                        // One failure stops the whole level
                        stop.store(true, Ordering::SeqCst);
                    }
                    task
                })
                .await
                .expect("build worker panicked")
            });
        }

        let mut tasks = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(task) => {
                    let marker = if task.status == BuildStatus::Complete {
                        style("ok".to_string()).green()
                    } else {
                        style(task.status.to_string()).red()
                    };
                    println!("   {} {} [{}]", style("->").blue(), task.package_name, marker);
                    tasks.push(task);
                }
                Err(e) => error!("build worker failed: {}", e),
            }
        }

        tasks.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        tasks
    }

    /// Build a single package through the pool-less path
    async fn run_one(&self, name: String, srpm: PathBuf, no_poll: bool) -> BuildTask {
        let hub = self.hub.clone();
        let target = self.target.clone();
        let opts = self.opts.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || {
            let mut task = BuildTask::new(&name, &srpm, &target);
            run_build(hub.as_ref(), &mut task, &opts, no_poll, &stop, &cancel);
            task
        })
        .await
        .expect("build worker panicked")
    }

    /// Build one package without dependency resolution
    pub async fn build_single(&self, srpm_path: &Path) -> DepforgeResult<BuildResult> {
        let started = Instant::now();
        let info = srpm::package_info(srpm_path)?;

        let mut task = self
            .run_one(info.name.clone(), srpm_path.to_path_buf(), self.opts.no_wait)
            .await;
        task.nvr = Some(info.nvr());

        // A submit-and-return task counts as success
        if self.opts.no_wait && task.status == BuildStatus::Building {
            let mut result = BuildResult {
                tasks: vec![task],
                ..Default::default()
            };
            result.built_packages.push(info.name);
            result.success = true;
            result.total_seconds = started.elapsed().as_secs_f64();
            return Ok(result);
        }

        Ok(BuildResult {
            tasks: vec![task],
            ..Default::default()
        }
        .finalize(started))
    }

    /// Build an explicit sequence of packages in order, with a repo
    /// regeneration after each success; stops at the first failure
    pub async fn build_chain(&self, packages: Vec<(String, PathBuf)>) -> BuildResult {
        let started = Instant::now();
        let mut result = BuildResult::default();

        for (name, srpm) in packages {
            let task = self.run_one(name, srpm, false).await;
            let ok = task.status == BuildStatus::Complete;
            result.tasks.push(task);

            if !ok {
                break;
            }

            let hub = self.hub.clone();
            let tag = self.build_tag.clone();
            let timeout = self.opts.repo_timeout;
            let _ = tokio::task::spawn_blocking(move || hub.wait_for_repo(&tag, timeout)).await;
        }

        result.finalize(started)
    }
}

/// Submit one build and poll it to a terminal state.
///
/// Runs on a blocking-pool thread. `stop` is the level-failure flag
/// shared between siblings; `cancel` is the user interrupt. Either one
/// stops new submissions and cancels a build already in flight.
fn run_build(
    hub: &dyn Hub,
    task: &mut BuildTask,
    opts: &OrchestratorOptions,
    no_poll: bool,
    stop: &AtomicBool,
    cancel: &AtomicBool,
) {
    if stop.load(Ordering::SeqCst) || cancel.load(Ordering::SeqCst) {
        task.status = BuildStatus::Canceled;
        task.error_message = Some("canceled before submission".to_string());
        return;
    }

    let submit = SubmitOptions {
        scratch: opts.scratch,
        nowait: true,
    };

    let task_id = match hub.submit_build(&task.target, &task.srpm_path, submit) {
        Ok(id) => id,
        Err(e) => {
            task.status = BuildStatus::Failed;
            task.error_message = Some(e.to_string());
            return;
        }
    };

    task.task_id = Some(task_id);
    task.status = BuildStatus::Building;
    info!("submitted {} as task {}", task.package_name, task_id);

    if no_poll {
        return;
    }

    let deadline = Instant::now() + opts.task_timeout;
    let mut delay = opts.poll_initial;

    loop {
        std::thread::sleep(delay);

        if stop.load(Ordering::SeqCst) || cancel.load(Ordering::SeqCst) {
            if hub.cancel_task(task_id).unwrap_or(false) {
                info!("canceled task {} ({})", task_id, task.package_name);
            }
            task.status = BuildStatus::Canceled;
            task.error_message = Some(
                DepforgeError::KojiBuild {
                    package: task.package_name.clone(),
                    kind: BuildErrorKind::Canceled,
                    detail: "canceled".to_string(),
                }
                .to_string(),
            );
            return;
        }

        match hub.task_status(task_id) {
            Ok(status) if status.is_terminal() => {
                task.status = status;
                if status != BuildStatus::Complete {
                    let kind = if status == BuildStatus::Canceled {
                        BuildErrorKind::Canceled
                    } else {
                        BuildErrorKind::TaskFailed
                    };
                    task.error_message = Some(
                        DepforgeError::KojiBuild {
                            package: task.package_name.clone(),
                            kind,
                            detail: format!("task ended {}", status),
                        }
                        .to_string(),
                    );
                }
                return;
            }
            Ok(status) => {
                task.status = status;
            }
            Err(e) => {
                warn!("status poll for task {} failed: {}", task_id, e);
            }
        }

        if Instant::now() >= deadline {
            let _ = hub.cancel_task(task_id);
            task.status = BuildStatus::Failed;
            task.error_message = Some(
                DepforgeError::KojiBuild {
                    package: task.package_name.clone(),
                    kind: BuildErrorKind::Timeout,
                    detail: format!("timed out after {} seconds", opts.task_timeout.as_secs()),
                }
                .to_string(),
            );
            return;
        }

        delay = (delay * 3 / 2).min(opts.poll_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NameResolutionMode;
    use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Scriptable in-memory hub
    struct MockHub {
        tagged: BTreeSet<String>,
        failing: HashSet<String>,
        hang_building: HashSet<String>,
        next_id: AtomicU64,
        submissions: Mutex<Vec<String>>,
        id_to_package: Mutex<HashMap<u64, String>>,
        scripted: Mutex<HashMap<u64, VecDeque<BuildStatus>>>,
        canceled: Mutex<Vec<u64>>,
        repo_waits: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        terminal: Mutex<HashSet<u64>>,
    }

    impl MockHub {
        fn new(failing: &[&str], hang_building: &[&str]) -> Self {
            Self {
                tagged: BTreeSet::new(),
                failing: failing.iter().map(|s| s.to_string()).collect(),
                hang_building: hang_building.iter().map(|s| s.to_string()).collect(),
                next_id: AtomicU64::new(100),
                submissions: Mutex::new(Vec::new()),
                id_to_package: Mutex::new(HashMap::new()),
                scripted: Mutex::new(HashMap::new()),
                canceled: Mutex::new(Vec::new()),
                repo_waits: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                terminal: Mutex::new(HashSet::new()),
            }
        }

        fn package_of(&self, task_id: u64) -> String {
            self.id_to_package
                .lock()
                .unwrap()
                .get(&task_id)
                .cloned()
                .unwrap_or_default()
        }

        fn mark_terminal(&self, task_id: u64) {
            if self.terminal.lock().unwrap().insert(task_id) {
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl Hub for MockHub {
        fn list_packages(&self, _tag: &str) -> DepforgeResult<BTreeSet<String>> {
            Ok(self.tagged.clone())
        }

        fn package_exists(&self, name: &str, _tag: &str) -> DepforgeResult<bool> {
            Ok(self.tagged.contains(name))
        }

        fn list_tagged_builds(&self, _tag: &str) -> DepforgeResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }

        fn submit_build(
            &self,
            _target: &str,
            srpm: &Path,
            _opts: SubmitOptions,
        ) -> DepforgeResult<u64> {
            let package = srpm
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .trim_end_matches(".src.rpm")
                .to_string();

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.submissions.lock().unwrap().push(package.clone());
            self.id_to_package.lock().unwrap().insert(id, package);

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            Ok(id)
        }

        fn task_status(&self, task_id: u64) -> DepforgeResult<BuildStatus> {
            if let Some(script) = self.scripted.lock().unwrap().get_mut(&task_id) {
                if let Some(status) = script.pop_front() {
                    if status.is_terminal() {
                        self.mark_terminal(task_id);
                    }
                    return Ok(status);
                }
            }

            let package = self.package_of(task_id);
            if self.hang_building.contains(&package) {
                return Ok(BuildStatus::Building);
            }

            let status = if self.failing.contains(&package) {
                BuildStatus::Failed
            } else {
                BuildStatus::Complete
            };
            self.mark_terminal(task_id);
            Ok(status)
        }

        fn cancel_task(&self, task_id: u64) -> DepforgeResult<bool> {
            self.canceled.lock().unwrap().push(task_id);
            self.mark_terminal(task_id);
            Ok(true)
        }

        fn wait_for_repo(&self, _tag: &str, _timeout: Duration) -> DepforgeResult<bool> {
            self.repo_waits.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        fn invalidate(&self) {}
    }

    fn test_options() -> OrchestratorOptions {
        OrchestratorOptions {
            max_parallel: 2,
            poll_initial: Duration::from_millis(5),
            poll_max: Duration::from_millis(10),
            task_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn orchestrator(hub: Arc<MockHub>, opts: OrchestratorOptions) -> BuildOrchestrator {
        let names = Arc::new(NameResolver::new(NameResolutionMode::RulesOnly, None));
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(SrpmFetcher::new(
            dir.path().to_path_buf(),
            Vec::new(),
            names.clone(),
        ));
        BuildOrchestrator::new(hub, fetcher, names, "fedora-target", "fedora-build", opts)
    }

    /// Two-level plan: [{lib-one, lib-two}, {my-app}]
    fn two_level_fixture() -> (DependencyGraph, Vec<Vec<String>>, PackageInfo) {
        let mut graph = DependencyGraph::new();

        let mut root = crate::resolve::DependencyNode::pending(
            "my-app",
            Some(PathBuf::from("/srpms/my-app.src.rpm")),
        );
        root.dependencies.insert("lib-one".to_string());
        root.dependencies.insert("lib-two".to_string());
        graph.insert(root);

        graph.insert(crate::resolve::DependencyNode::pending(
            "lib-one",
            Some(PathBuf::from("/srpms/lib-one.src.rpm")),
        ));
        graph.insert(crate::resolve::DependencyNode::pending(
            "lib-two",
            Some(PathBuf::from("/srpms/lib-two.src.rpm")),
        ));

        let chain = vec![
            vec!["lib-one".to_string(), "lib-two".to_string()],
            vec!["my-app".to_string()],
        ];

        let info = PackageInfo {
            name: "my-app".to_string(),
            version: "1.0".to_string(),
            release: "1".to_string(),
            epoch: None,
            build_requires: Vec::new(),
            source_urls: Vec::new(),
        };

        (graph, chain, info)
    }

    #[tokio::test]
    async fn test_happy_path() {
        let hub = Arc::new(MockHub::new(&[], &[]));
        let orch = orchestrator(hub.clone(), test_options());
        let (graph, chain, info) = two_level_fixture();

        let result = orch
            .execute_chain(
                &graph,
                &chain,
                &info,
                Path::new("/srpms/my-app.src.rpm"),
                Instant::now(),
            )
            .await;

        assert!(result.success);
        let mut built = result.built_packages.clone();
        built.sort();
        assert_eq!(built, vec!["lib-one", "lib-two", "my-app"]);
        assert!(result.failed_packages.is_empty());

        // Root submitted last, after a repo regeneration
        let submissions = hub.submissions.lock().unwrap().clone();
        assert_eq!(submissions.len(), 3);
        assert_eq!(submissions.last().unwrap(), "my-app");
        assert!(hub.repo_waits.load(Ordering::SeqCst) >= 1);

        // Worker pool kept concurrent submissions within bounds
        assert!(hub.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_level_failure_stops_run() {
        // lib-two fails fast, lib-one hangs in BUILDING until canceled
        let hub = Arc::new(MockHub::new(&["lib-two"], &["lib-one"]));
        let orch = orchestrator(hub.clone(), test_options());
        let (graph, chain, info) = two_level_fixture();

        let result = orch
            .execute_chain(
                &graph,
                &chain,
                &info,
                Path::new("/srpms/my-app.src.rpm"),
                Instant::now(),
            )
            .await;

        assert!(!result.success);
        assert!(result
            .failed_packages
            .contains(&"lib-two".to_string()));

        // The hanging sibling was canceled, and the root never submitted
        assert!(!hub.canceled.lock().unwrap().is_empty());
        let submissions = hub.submissions.lock().unwrap().clone();
        assert!(!submissions.contains(&"my-app".to_string()));

        // No repo wait after a failed level
        assert_eq!(hub.repo_waits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_per_node_single_submission() {
        let hub = Arc::new(MockHub::new(&[], &[]));
        let orch = orchestrator(hub.clone(), test_options());
        let (graph, chain, info) = two_level_fixture();

        orch.execute_chain(
            &graph,
            &chain,
            &info,
            Path::new("/srpms/my-app.src.rpm"),
            Instant::now(),
        )
        .await;

        let submissions = hub.submissions.lock().unwrap().clone();
        let unique: HashSet<&String> = submissions.iter().collect();
        assert_eq!(submissions.len(), unique.len(), "a package was submitted twice");
    }

    #[tokio::test]
    async fn test_user_cancellation_skips_root() {
        let hub = Arc::new(MockHub::new(&[], &[]));
        let orch = orchestrator(hub.clone(), test_options());
        let (graph, chain, info) = two_level_fixture();

        // Cancel before anything starts
        orch.cancel_flag().store(true, Ordering::SeqCst);

        let result = orch
            .execute_chain(
                &graph,
                &chain,
                &info,
                Path::new("/srpms/my-app.src.rpm"),
                Instant::now(),
            )
            .await;

        assert!(!result.success);
        assert!(hub.submissions.lock().unwrap().is_empty());
        assert!(result
            .tasks
            .iter()
            .all(|t| t.status == BuildStatus::Canceled));
    }

    #[tokio::test]
    async fn test_scripted_building_then_complete() {
        let hub = Arc::new(MockHub::new(&[], &[]));
        // Task 100 reports BUILDING twice before completing
        hub.scripted.lock().unwrap().insert(
            100,
            VecDeque::from([
                BuildStatus::Building,
                BuildStatus::Building,
                BuildStatus::Complete,
            ]),
        );

        let orch = orchestrator(hub.clone(), test_options());
        let task = orch
            .run_one(
                "slow-pkg".to_string(),
                PathBuf::from("/srpms/slow-pkg.src.rpm"),
                false,
            )
            .await;

        assert_eq!(task.status, BuildStatus::Complete);
        assert_eq!(task.task_id, Some(100));
    }

    #[tokio::test]
    async fn test_build_chain_stops_at_failure() {
        let hub = Arc::new(MockHub::new(&["pkg-b"], &[]));
        let orch = orchestrator(hub.clone(), test_options());

        let result = orch
            .build_chain(vec![
                ("pkg-a".to_string(), PathBuf::from("/srpms/pkg-a.src.rpm")),
                ("pkg-b".to_string(), PathBuf::from("/srpms/pkg-b.src.rpm")),
                ("pkg-c".to_string(), PathBuf::from("/srpms/pkg-c.src.rpm")),
            ])
            .await;

        assert!(!result.success);
        assert_eq!(result.built_packages, vec!["pkg-a"]);
        assert_eq!(result.failed_packages, vec!["pkg-b"]);

        let submissions = hub.submissions.lock().unwrap().clone();
        assert!(!submissions.contains(&"pkg-c".to_string()));
    }

    #[tokio::test]
    async fn test_poll_timeout_fails_task() {
        // The task never leaves BUILDING; the deadline has to fire
        let hub = Arc::new(MockHub::new(&[], &["stuck-pkg"]));
        let opts = OrchestratorOptions {
            task_timeout: Duration::from_millis(30),
            ..test_options()
        };
        let orch = orchestrator(hub.clone(), opts);

        let task = orch
            .run_one(
                "stuck-pkg".to_string(),
                PathBuf::from("/srpms/stuck-pkg.src.rpm"),
                false,
            )
            .await;

        assert_eq!(task.status, BuildStatus::Failed);
        assert!(task.error_message.unwrap().contains("timed out"));
        assert!(!hub.canceled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_wait_submits_without_polling() {
        let hub = Arc::new(MockHub::new(&[], &[]));
        let orch = orchestrator(hub.clone(), test_options());

        let task = orch
            .run_one(
                "quick-pkg".to_string(),
                PathBuf::from("/srpms/quick-pkg.src.rpm"),
                true,
            )
            .await;

        assert_eq!(task.status, BuildStatus::Building);
        assert!(task.task_id.is_some());
        // No taskinfo polls happened
        assert!(hub.terminal.lock().unwrap().is_empty());
    }

    #[test]
    fn test_result_finalize() {
        let started = Instant::now();
        let mut result = BuildResult::default();

        let mut ok = BuildTask::new("good", Path::new("/x.src.rpm"), "t");
        ok.status = BuildStatus::Complete;
        let mut bad = BuildTask::new("bad", Path::new("/y.src.rpm"), "t");
        bad.status = BuildStatus::Failed;
        result.tasks = vec![ok, bad];

        let result = result.finalize(started);
        assert!(!result.success);
        assert_eq!(result.built_packages, vec!["good"]);
        assert_eq!(result.failed_packages, vec!["bad"]);
        assert!(result.total_seconds >= 0.0);
    }
}
