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

//! Canonicalization of dependency tokens into real package names.
//!
//! Virtual provides like `python3dist(requests)`, `pkgconfig(glib-2.0)`, or
//! `perl(File::Path)` are rewritten to the binary package names that carry
//! them; partly-expanded macros are expanded first. Pipeline order: cache,
//! macro expansion, virtual-provide rewrite, similarity-model fallback,
//! identity.

use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::ml::MlResolver;
use crate::config::NameResolutionMode;
use crate::error::{DepforgeError, DepforgeResult};
use crate::spec::macros::MacroTable;

/// Rewrite rules for the known virtual-provide dialects
struct ProvidePatterns {
    python_dist: Regex,
    pkgconfig: Regex,
    perl: Regex,
    rubygem: Regex,
    npm: Regex,
    cmake: Regex,
    tex: Regex,
    golang: Regex,
    mvn: Regex,
}

impl ProvidePatterns {
    fn new() -> Self {
        Self {
            python_dist: Regex::new(r"^python(\d*(?:\.\d+)?)dist\((.+)\)$").unwrap(),
            pkgconfig: Regex::new(r"^pkgconfig\((.+)\)$").unwrap(),
            perl: Regex::new(r"^perl\((.+)\)$").unwrap(),
            rubygem: Regex::new(r"^rubygem\((.+)\)$").unwrap(),
            npm: Regex::new(r"^npm\((.+)\)$").unwrap(),
            cmake: Regex::new(r"^cmake\((.+)\)$").unwrap(),
            tex: Regex::new(r"^tex\((.+)\)$").unwrap(),
            golang: Regex::new(r"^golang\((.+)\)$").unwrap(),
            mvn: Regex::new(r"^mvn\(([^:]+):([^:]+)\)$").unwrap(),
        }
    }

    /// Apply the first matching rewrite, or None for plain names
    fn rewrite(&self, name: &str) -> Option<String> {
        if let Some(caps) = self.python_dist.captures(name) {
            let pyver = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let pyver = if pyver.is_empty() { "3" } else { pyver };
            return Some(format!("python{}-{}", pyver, &caps[2]));
        }
        if let Some(caps) = self.pkgconfig.captures(name) {
            return Some(format!("{}-devel", &caps[1]));
        }
        if let Some(caps) = self.perl.captures(name) {
            return Some(format!("perl-{}", caps[1].replace("::", "-")));
        }
        if let Some(caps) = self.rubygem.captures(name) {
            return Some(format!("rubygem-{}", &caps[1]));
        }
        if let Some(caps) = self.npm.captures(name) {
            return Some(format!("nodejs-{}", &caps[1]));
        }
        if let Some(caps) = self.cmake.captures(name) {
            return Some(format!("cmake-{}", caps[1].to_lowercase()));
        }
        if let Some(caps) = self.tex.captures(name) {
            return Some(format!("texlive-{}", &caps[1]));
        }
        if let Some(caps) = self.golang.captures(name) {
            return Some(format!("golang-{}", caps[1].replace('/', "-")));
        }
        if let Some(caps) = self.mvn.captures(name) {
            // Maven coordinates map to the artifact-id package
            return Some(caps[2].to_string());
        }
        None
    }
}

/// Resolves dependency tokens to real binary package names
pub struct NameResolver {
    mode: NameResolutionMode,
    macros: MacroTable,
    patterns: ProvidePatterns,
    ml: Option<MlResolver>,
    python_prefix: Regex,
    cache: Mutex<HashMap<String, String>>,
}

impl NameResolver {
    pub fn new(mode: NameResolutionMode, ml: Option<MlResolver>) -> Self {
        let ml = match mode {
            NameResolutionMode::RulesMl => ml,
            _ => None,
        };

        Self {
            mode,
            macros: MacroTable::new(),
            patterns: ProvidePatterns::new(),
            ml,
            python_prefix: Regex::new(r"^python(\d+(?:\.\d+)?)-(.+)$").unwrap(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a dependency token to a binary package name.
    ///
    /// With resolution off the token passes through untouched. Otherwise:
    /// cache, macro expansion, virtual-provide rewrite, similarity fallback
    /// (only for tokens that still look like an unresolved virtual provide),
    /// and finally the expanded token itself.
    pub fn resolve(&self, token: &str) -> String {
        if token.is_empty() || self.mode == NameResolutionMode::Off {
            return token.to_string();
        }

        if let Some(hit) = self.cache.lock().unwrap().get(token) {
            return hit.clone();
        }

        let expanded = self.macros.expand(token);

        let resolved = match self.patterns.rewrite(&expanded) {
            Some(name) => name,
            None => self.ml_fallback(&expanded).unwrap_or(expanded),
        };

        self.cache
            .lock()
            .unwrap()
            .insert(token.to_string(), resolved.clone());
        resolved
    }

    /// Like [`resolve`](Self::resolve), but reports tokens that resolve
    /// to nothing (e.g. an optional macro that expanded to the empty
    /// string)
    pub fn resolve_checked(&self, token: &str) -> DepforgeResult<String> {
        let resolved = self.resolve(token);
        if resolved.is_empty() && !token.is_empty() {
            return Err(DepforgeError::NameResolution {
                token: token.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Similarity lookup for tokens the rules could not rewrite
    fn ml_fallback(&self, expanded: &str) -> Option<String> {
        // Plain names never go through the model; only unresolved
        // virtual-provide syntax does
        if !expanded.contains('(') {
            return None;
        }

        let ml = self.ml.as_ref()?;
        let prediction = ml.predict(expanded)?;
        if prediction.rpm_name == expanded {
            return None;
        }

        debug!(
            "similarity model resolved '{}' -> '{}' (distance {:.3})",
            expanded, prediction.rpm_name, prediction.distance
        );
        Some(prediction.rpm_name)
    }

    /// Probable source-package names for a binary package name, most
    /// likely first.
    ///
    /// Binary and source names frequently differ: `python3-requests` is
    /// built from `python-requests`, `glib2-devel` from `glib2`. The
    /// shorter source-style name is tried before the binary form.
    pub fn srpm_candidates(&self, rpm_name: &str) -> Vec<String> {
        let mut candidates = Vec::new();

        if let Some(caps) = self.python_prefix.captures(rpm_name) {
            candidates.push(format!("python-{}", &caps[2]));
            candidates.push(rpm_name.to_string());
        } else if let Some(base) = rpm_name.strip_suffix("-devel") {
            candidates.push(base.to_string());
            candidates.push(rpm_name.to_string());
        } else if let Some(base) = rpm_name.strip_suffix("-libs") {
            candidates.push(base.to_string());
            candidates.push(rpm_name.to_string());
        } else {
            // perl-/rubygem-/nodejs-/golang- prefixed packages and
            // everything else usually share the source name
            candidates.push(rpm_name.to_string());
        }

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        candidates
    }
}
