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

//! SRPM fetching with on-disk caching and duplicate collapse.
//!
//! Candidate source names from the canonicalizer are tried against every
//! configured source in priority order. Concurrent fetches of the same
//! package share one in-flight download.

pub mod sources;

pub use sources::{DistGitSource, KojiSource, SrpmSource};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DepforgeError, DepforgeResult};
use crate::resolve::NameResolver;

/// Download retry policy: 2 attempts, linear backoff from 5 s
const DOWNLOAD_ATTEMPTS: u32 = 2;
const DOWNLOAD_BACKOFF: Duration = Duration::from_secs(5);

/// Downloads SRPMs by package name from prioritized sources
pub struct SrpmFetcher {
    download_dir: PathBuf,
    sources: Vec<SrpmSource>,
    names: Arc<NameResolver>,
    backoff: Duration,
    resolved: Mutex<HashMap<String, PathBuf>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SrpmFetcher {
    /// Fetcher with the built-in Koji and dist-git sources
    pub fn from_config(config: &Config, names: Arc<NameResolver>) -> DepforgeResult<Self> {
        let mut sources = vec![
            SrpmSource::Koji(KojiSource::new(&config.koji, &config.fetch.fedora_release)),
            SrpmSource::DistGit(DistGitSource::new(
                sources::DEFAULT_DISTGIT_URL,
                &config.fetch.fedora_release,
                config.koji.no_ssl_verify,
            )?),
        ];

        for entry in &config.fetch.sources {
            let mut source = DistGitSource::new(
                &entry.base_url,
                &config.fetch.fedora_release,
                config.koji.no_ssl_verify,
            )?;
            source.id = entry.id.clone();
            source.priority = entry.priority;
            sources.push(SrpmSource::DistGit(source));
        }

        let download_dir = config
            .fetch
            .download_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("depforge"));

        Ok(Self::new(download_dir, sources, names))
    }

    pub fn new(download_dir: PathBuf, mut sources: Vec<SrpmSource>, names: Arc<NameResolver>) -> Self {
        sources.sort_by_key(|s| s.priority());

        Self {
            download_dir,
            sources,
            names,
            backoff: DOWNLOAD_BACKOFF,
            resolved: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Download the SRPM for a package, returning its local path.
    ///
    /// Cached results are reused; concurrent calls for the same key block
    /// on a single download.
    pub async fn fetch(&self, package: &str, version: Option<&str>) -> DepforgeResult<PathBuf> {
        let key = match version {
            Some(version) => format!("{}-{}", package, version),
            None => package.to_string(),
        };

        // Per-key gate: the first caller downloads, the rest wait and hit
        // the cache when the guard is released
        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(key.clone()).or_default().clone()
        };
        let _guard = gate.lock().await;

        if let Some(path) = self.cached(package, version, &key).await {
            debug!("cache hit for {}", key);
            return Ok(path);
        }

        let path = self.download(package, version).await?;

        self.resolved
            .lock()
            .await
            .insert(key.clone(), path.clone());
        info!("fetched SRPM for {}: {}", key, path.display());
        Ok(path)
    }

    /// Probe the in-memory map and the cache directory
    async fn cached(&self, package: &str, version: Option<&str>, key: &str) -> Option<PathBuf> {
        if let Some(path) = self.resolved.lock().await.get(key) {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Downloads land in <cache>/<package>/<nvr>.src.rpm
        let dir = self.download_dir.join(package);
        let path = sources::find_srpm(&dir).ok().flatten()?;

        if let Some(version) = version {
            let prefix = format!("{}-{}", package, version);
            let name = path.file_name().and_then(|n| n.to_str())?;
            if !name.starts_with(&prefix) {
                return None;
            }
        }

        Some(path)
    }

    /// Try every candidate name against every source in priority order
    async fn download(&self, package: &str, version: Option<&str>) -> DepforgeResult<PathBuf> {
        std::fs::create_dir_all(&self.download_dir)
            .map_err(|e| DepforgeError::io(self.download_dir.display().to_string(), e))?;

        let candidates = self.names.srpm_candidates(package);
        let mut errors = Vec::new();

        for candidate in &candidates {
            for source in &self.sources {
                match self.attempt(source, candidate, version).await {
                    Ok(path) => return Ok(path),
                    Err(e) => {
                        debug!("{} via {}: {}", candidate, source.id(), e);
                        errors.push(format!("{} ({}): {}", source.id(), candidate, e));
                    }
                }
            }
        }

        Err(DepforgeError::SrpmNotFound {
            package: package.to_string(),
            detail: errors.join("; "),
        })
    }

    /// One candidate against one source, with bounded retries on
    /// transient failures
    async fn attempt(
        &self,
        source: &SrpmSource,
        candidate: &str,
        version: Option<&str>,
    ) -> DepforgeResult<PathBuf> {
        let mut last = None;

        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match source.fetch(candidate, version, &self.download_dir).await {
                Ok(path) => return Ok(path),
                Err(e) => {
                    if !e.is_retryable() || attempt == DOWNLOAD_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(
                        "download of {} from {} failed (attempt {}/{}): {}",
                        candidate,
                        source.id(),
                        attempt,
                        DOWNLOAD_ATTEMPTS,
                        e
                    );
                    last = Some(e);
                    tokio::time::sleep(self.backoff * attempt).await;
                }
            }
        }

        Err(last.unwrap_or_else(|| DepforgeError::SrpmNotFound {
            package: candidate.to_string(),
            detail: "download retries exhausted".to_string(),
        }))
    }

    /// Remove the cache directory and forget resolved paths
    pub async fn cleanup(&self) -> DepforgeResult<()> {
        if self.download_dir.exists() {
            std::fs::remove_dir_all(&self.download_dir)
                .map_err(|e| DepforgeError::io(self.download_dir.display().to_string(), e))?;
        }
        self.resolved.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::sources::MockSource;
    use super::*;
    use crate::config::NameResolutionMode;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn names() -> Arc<NameResolver> {
        Arc::new(NameResolver::new(NameResolutionMode::RulesOnly, None))
    }

    fn mock_fetcher(dir: &Path, sources: Vec<SrpmSource>) -> Arc<SrpmFetcher> {
        let mut fetcher = SrpmFetcher::new(dir.to_path_buf(), sources, names());
        fetcher.backoff = Duration::from_millis(1);
        Arc::new(fetcher)
    }

    #[tokio::test]
    async fn test_fetch_from_mock_source() {
        let dir = tempdir().unwrap();
        let source = MockSource::new("primary", 10, &["gcc"]);
        let fetcher = mock_fetcher(dir.path(), vec![SrpmSource::Mock(source)]);

        let path = fetcher.fetch("gcc", None).await.unwrap();
        assert!(path.exists());
        assert!(path.to_str().unwrap().ends_with("gcc-1.0-1.src.rpm"));
    }

    #[tokio::test]
    async fn test_fetch_not_found_lists_attempts() {
        let dir = tempdir().unwrap();
        let source = MockSource::new("primary", 10, &[]);
        let fetcher = mock_fetcher(dir.path(), vec![SrpmSource::Mock(source)]);

        let err = fetcher.fetch("nope", None).await.unwrap_err();
        match err {
            DepforgeError::SrpmNotFound { package, detail } => {
                assert_eq!(package, "nope");
                assert!(detail.contains("primary"));
            }
            other => panic!("expected SrpmNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_priority_order() {
        let dir = tempdir().unwrap();
        let low = MockSource::new("low-prio", 50, &["pkg"]);
        let high = MockSource::new("high-prio", 10, &["pkg"]);
        let low_count = low.fetch_count.clone();
        let high_count = high.fetch_count.clone();

        let fetcher = mock_fetcher(
            dir.path(),
            vec![SrpmSource::Mock(low), SrpmSource::Mock(high)],
        );

        fetcher.fetch("pkg", None).await.unwrap();
        assert_eq!(high_count.load(Ordering::SeqCst), 1);
        assert_eq!(low_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_candidate_names_tried_in_order() {
        let dir = tempdir().unwrap();
        // Source only knows the python- source name, not the binary name
        let source = MockSource::new("primary", 10, &["python-requests"]);
        let count = source.fetch_count.clone();
        let fetcher = mock_fetcher(dir.path(), vec![SrpmSource::Mock(source)]);

        let path = fetcher.fetch("python3-requests", None).await.unwrap();
        assert!(path.to_str().unwrap().contains("python-requests"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_fetch_hits_cache() {
        let dir = tempdir().unwrap();
        let source = MockSource::new("primary", 10, &["gcc"]);
        let count = source.fetch_count.clone();
        let fetcher = mock_fetcher(dir.path(), vec![SrpmSource::Mock(source)]);

        fetcher.fetch("gcc", None).await.unwrap();
        fetcher.fetch("gcc", None).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_collapse() {
        let dir = tempdir().unwrap();
        let mut source = MockSource::new("primary", 10, &["glibc"]);
        source.delay = Duration::from_millis(50);
        let count = source.fetch_count.clone();
        let fetcher = mock_fetcher(dir.path(), vec![SrpmSource::Mock(source)]);

        let a = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch("glibc", None).await }
        });
        let b = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch("glibc", None).await }
        });

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, b);
        assert_eq!(count.load(Ordering::SeqCst), 1, "download ran more than once");
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let dir = tempdir().unwrap();
        let mut source = MockSource::new("primary", 10, &["gcc"]);
        source.transient_failures = Arc::new(std::sync::atomic::AtomicUsize::new(1));
        let count = source.fetch_count.clone();
        let fetcher = mock_fetcher(dir.path(), vec![SrpmSource::Mock(source)]);

        // First attempt hits the scripted network error, the retry lands
        let path = fetcher.fetch("gcc", None).await.unwrap();
        assert!(path.exists());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_version_keyed_cache() {
        let dir = tempdir().unwrap();
        let source = MockSource::new("primary", 10, &["gcc"]);
        let fetcher = mock_fetcher(dir.path(), vec![SrpmSource::Mock(source)]);

        let path = fetcher.fetch("gcc", Some("1.0")).await.unwrap();
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .starts_with("gcc-1.0"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_cache() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let source = MockSource::new("primary", 10, &["gcc"]);
        let fetcher = mock_fetcher(&cache_dir, vec![SrpmSource::Mock(source)]);

        fetcher.fetch("gcc", None).await.unwrap();
        assert!(cache_dir.exists());

        fetcher.cleanup().await.unwrap();
        assert!(!cache_dir.exists());
    }
}
