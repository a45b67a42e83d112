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

//! Upstream SRPM sources.
//!
//! The primary source pulls ready-made source RPMs from Koji; the
//! fallback clones the spec and referenced sources from dist-git and
//! builds an SRPM locally with `rpmbuild -bs`.

use futures::StreamExt;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::KojiConfig;
use crate::error::{DepforgeError, DepforgeResult};
use crate::koji::KojiClient;

pub const DEFAULT_DISTGIT_URL: &str = "https://src.fedoraproject.org/rpms";
pub const LOOKASIDE_URL: &str = "https://src.fedoraproject.org/lookaside/pkgs";

/// One upstream SRPM source, tried in ascending priority order
pub enum SrpmSource {
    Koji(KojiSource),
    DistGit(DistGitSource),
    #[cfg(test)]
    Mock(MockSource),
}

impl SrpmSource {
    pub fn id(&self) -> &str {
        match self {
            SrpmSource::Koji(s) => &s.id,
            SrpmSource::DistGit(s) => &s.id,
            #[cfg(test)]
            SrpmSource::Mock(s) => &s.id,
        }
    }

    pub fn priority(&self) -> u32 {
        match self {
            SrpmSource::Koji(s) => s.priority,
            SrpmSource::DistGit(s) => s.priority,
            #[cfg(test)]
            SrpmSource::Mock(s) => s.priority,
        }
    }

    /// Obtain an SRPM for `package` below `dest`
    pub async fn fetch(
        &self,
        package: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> DepforgeResult<PathBuf> {
        match self {
            SrpmSource::Koji(s) => s.fetch(package, version, dest),
            SrpmSource::DistGit(s) => s.fetch(package, dest).await,
            #[cfg(test)]
            SrpmSource::Mock(s) => s.fetch(package, dest).await,
        }
    }
}

/// Koji-backed source: `latest-build` + `download-build --arch=src`
pub struct KojiSource {
    pub id: String,
    pub priority: u32,
    client: KojiClient,
    release_tag: String,
}

impl KojiSource {
    pub fn new(config: &KojiConfig, release_tag: &str) -> Self {
        Self {
            id: "koji".to_string(),
            priority: 10,
            client: KojiClient::new(config),
            release_tag: release_tag.to_string(),
        }
    }

    fn fetch(&self, package: &str, version: Option<&str>, dest: &Path) -> DepforgeResult<PathBuf> {
        let nvr = match version {
            Some(version) => format!("{}-{}", package, version),
            None => self
                .client
                .latest_build(&self.release_tag, package)?
                .ok_or_else(|| DepforgeError::SrpmNotFound {
                    package: package.to_string(),
                    detail: format!("no build in tag '{}'", self.release_tag),
                })?,
        };

        let download_dir = dest.join(package);
        self.client.download_build(&nvr, &download_dir)?;

        find_srpm(&download_dir)?.ok_or_else(|| DepforgeError::SrpmNotFound {
            package: package.to_string(),
            detail: "download produced no .src.rpm".to_string(),
        })
    }
}

/// Dist-git fallback source: spec + lookaside sources + `rpmbuild -bs`
pub struct DistGitSource {
    pub id: String,
    pub priority: u32,
    base_url: String,
    release: String,
    client: reqwest::Client,
    source_header: Regex,
}

impl DistGitSource {
    pub fn new(base_url: &str, release: &str, no_ssl_verify: bool) -> DepforgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(no_ssl_verify)
            .user_agent(concat!("depforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DepforgeError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            id: "dist-git".to_string(),
            priority: 20,
            base_url: base_url.trim_end_matches('/').to_string(),
            release: release.to_string(),
            client,
            source_header: Regex::new(r"(?mi)^Source\d*:\s*(.+)$").unwrap(),
        })
    }

    async fn fetch(&self, package: &str, dest: &Path) -> DepforgeResult<PathBuf> {
        let spec_url = format!(
            "{}/{}/raw/{}/f/{}.spec",
            self.base_url, package, self.release, package
        );

        let response = self.client.get(&spec_url).send().await.map_err(|e| {
            DepforgeError::Network {
                url: spec_url.clone(),
                message: e.to_string(),
            }
        })?;

        if !response.status().is_success() {
            return Err(DepforgeError::SrpmNotFound {
                package: package.to_string(),
                detail: format!("no spec at {} (HTTP {})", spec_url, response.status()),
            });
        }

        let spec_content = response.text().await.map_err(|e| DepforgeError::Network {
            url: spec_url.clone(),
            message: e.to_string(),
        })?;

        let work_dir = dest.join(package).join("build");
        let sources_dir = work_dir.join("SOURCES");
        fs::create_dir_all(&sources_dir)
            .map_err(|e| DepforgeError::io(sources_dir.display().to_string(), e))?;

        let spec_path = work_dir.join(format!("{}.spec", package));
        fs::write(&spec_path, &spec_content)
            .map_err(|e| DepforgeError::io(spec_path.display().to_string(), e))?;

        for source in self.extract_sources(&spec_content) {
            let file_name = source.rsplit('/').next().unwrap_or(&source).to_string();

            if source.starts_with("http://")
                || source.starts_with("https://")
                || source.starts_with("ftp://")
            {
                self.download_file(&source, &sources_dir.join(&file_name))
                    .await?;
            } else {
                // Plain file names live in the lookaside cache; misses are
                // tolerated because rpmbuild only needs the files the spec
                // actually references at -bs time
                let lookaside = format!("{}/{}/{}", LOOKASIDE_URL, package, source);
                if let Err(e) = self.download_file(&lookaside, &sources_dir.join(&file_name)).await
                {
                    debug!("lookaside miss for {}: {}", source, e);
                }
            }
        }

        build_srpm(&spec_path, &work_dir, &sources_dir)?;

        find_srpm(&work_dir)?.ok_or_else(|| DepforgeError::SrpmNotFound {
            package: package.to_string(),
            detail: "rpmbuild produced no .src.rpm".to_string(),
        })
    }

    /// SourceN: entries of a spec file
    fn extract_sources(&self, spec_content: &str) -> Vec<String> {
        self.source_header
            .captures_iter(spec_content)
            .map(|caps| caps[1].trim().to_string())
            .collect()
    }

    /// Stream a file to disk with a progress bar when the size is known
    async fn download_file(&self, url: &str, dest: &Path) -> DepforgeResult<()> {
        use indicatif::{ProgressBar, ProgressStyle};

        debug!("downloading {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DepforgeError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(DepforgeError::Network {
                url: url.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }

        let total_size = response.content_length().unwrap_or(0);
        let pb = if total_size > 0 {
            let pb = ProgressBar::new(total_size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("   {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                    .unwrap()
                    .progress_chars("=>-"),
            );
            Some(pb)
        } else {
            None
        };

        let mut stream = response.bytes_stream();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DepforgeError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            data.extend_from_slice(&chunk);
            if let Some(pb) = &pb {
                pb.set_position(data.len() as u64);
            }
        }

        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        fs::write(dest, &data).map_err(|e| DepforgeError::io(dest.display().to_string(), e))?;
        Ok(())
    }
}

/// Run `rpmbuild -bs` with a redefined topdir layout
fn build_srpm(spec_path: &Path, work_dir: &Path, sources_dir: &Path) -> DepforgeResult<()> {
    let output = Command::new("rpmbuild")
        .arg("-bs")
        .args(["--define", &format!("_topdir {}", work_dir.display())])
        .args(["--define", &format!("_sourcedir {}", sources_dir.display())])
        .args(["--define", &format!("_srcrpmdir {}", work_dir.display())])
        .arg(spec_path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DepforgeError::Config {
                    message: "rpmbuild not found; install rpm-build".to_string(),
                }
            } else {
                DepforgeError::io("rpmbuild".to_string(), e)
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("rpmbuild -bs failed: {}", stderr.trim());
        return Err(DepforgeError::SrpmNotFound {
            package: spec_path.display().to_string(),
            detail: format!("rpmbuild -bs failed: {}", stderr.trim()),
        });
    }

    Ok(())
}

/// First `*.src.rpm` below a directory
pub fn find_srpm(dir: &Path) -> DepforgeResult<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let entries = fs::read_dir(dir).map_err(|e| DepforgeError::io(dir.display().to_string(), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| DepforgeError::io(dir.display().to_string(), e))?;
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.ends_with(".src.rpm") {
                return Ok(Some(path));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
pub struct MockSource {
    pub id: String,
    pub priority: u32,
    pub known: Vec<String>,
    pub fetch_count: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    pub transient_failures: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    pub delay: Duration,
}

#[cfg(test)]
impl MockSource {
    pub fn new(id: &str, priority: u32, known: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            priority,
            known: known.iter().map(|s| s.to_string()).collect(),
            fetch_count: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            transient_failures: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            delay: Duration::from_millis(0),
        }
    }

    async fn fetch(&self, package: &str, dest: &Path) -> DepforgeResult<PathBuf> {
        use std::sync::atomic::Ordering;

        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        // Scripted transient failures burn down before anything succeeds
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DepforgeError::Network {
                url: format!("mock://{}/{}", self.id, package),
                message: "connection reset".to_string(),
            });
        }

        if !self.known.iter().any(|k| k == package) {
            return Err(DepforgeError::SrpmNotFound {
                package: package.to_string(),
                detail: format!("not known to source '{}'", self.id),
            });
        }

        let dir = dest.join(package);
        fs::create_dir_all(&dir).map_err(|e| DepforgeError::io(dir.display().to_string(), e))?;
        let path = dir.join(format!("{}-1.0-1.src.rpm", package));
        fs::write(&path, b"mock srpm").map_err(|e| DepforgeError::io(path.display().to_string(), e))?;
        Ok(path)
    }
}
