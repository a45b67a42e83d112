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

//! Spec file parsing: identity headers, sources, and BuildRequires.

use std::fmt;
use std::fs;
use std::path::Path;
use tracing::warn;

use super::macros::MacroTable;
use crate::error::{DepforgeError, DepforgeResult};

/// Version comparison operator in a requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqOperator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    TildeEq,
}

impl ReqOperator {
    /// Parse an operator token; `==` normalizes to `=`
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" | "==" => Some(ReqOperator::Eq),
            "<" => Some(ReqOperator::Lt),
            "<=" => Some(ReqOperator::Le),
            ">" => Some(ReqOperator::Gt),
            ">=" => Some(ReqOperator::Ge),
            "~=" => Some(ReqOperator::TildeEq),
            _ => None,
        }
    }
}

impl fmt::Display for ReqOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReqOperator::Eq => write!(f, "="),
            ReqOperator::Lt => write!(f, "<"),
            ReqOperator::Le => write!(f, "<="),
            ReqOperator::Gt => write!(f, ">"),
            ReqOperator::Ge => write!(f, ">="),
            ReqOperator::TildeEq => write!(f, "~="),
        }
    }
}

/// A single build-time requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequirement {
    pub name: String,
    pub operator: Option<ReqOperator>,
    pub version: Option<String>,
}

impl BuildRequirement {
    /// Plain requirement without a version constraint
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator: None,
            version: None,
        }
    }

    /// Requirement with a version constraint
    pub fn versioned(name: impl Into<String>, operator: ReqOperator, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator: Some(operator),
            version: Some(version.into()),
        }
    }

    /// Parse a `"name [op version]"` string
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split_whitespace();
        let name = parts.next()?.to_string();

        match (parts.next(), parts.next()) {
            (Some(op), Some(version)) => {
                let operator = ReqOperator::parse(op)?;
                Some(Self::versioned(name, operator, version))
            }
            (None, _) => Some(Self::plain(name)),
            _ => None,
        }
    }
}

impl fmt::Display for BuildRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.operator, &self.version) {
            (Some(op), Some(version)) => write!(f, "{} {} {}", self.name, op, version),
            _ => write!(f, "{}", self.name),
        }
    }
}

/// Information extracted from a spec file or SRPM
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub release: String,
    pub epoch: Option<u32>,
    pub build_requires: Vec<BuildRequirement>,
    pub source_urls: Vec<String>,
}

impl PackageInfo {
    /// The name-version-release identifier
    pub fn nvr(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }
}

// Version operators ordered longest-first so `>=` wins over `>`
const OPERATOR_TOKENS: &[&str] = &[">=", "<=", "==", "~=", ">", "<", "="];

/// Parses RPM spec files into [`PackageInfo`]
pub struct SpecAnalyzer {
    macros: MacroTable,
    unresolved: Vec<String>,
}

impl SpecAnalyzer {
    pub fn new() -> Self {
        Self {
            macros: MacroTable::new(),
            unresolved: Vec::new(),
        }
    }

    /// Parse a spec file on disk
    pub fn analyze_file(&mut self, spec_path: &Path) -> DepforgeResult<PackageInfo> {
        let content = fs::read_to_string(spec_path)
            .map_err(|e| DepforgeError::io(spec_path.display().to_string(), e))?;
        self.analyze(&content)
    }

    /// Parse spec file content
    pub fn analyze(&mut self, content: &str) -> DepforgeResult<PackageInfo> {
        let mut name = None;
        let mut version = None;
        let mut release = None;
        let mut epoch = None;
        let mut build_requires = Vec::new();
        let mut source_urls = Vec::new();

        for line in content.lines() {
            let line = line.trim();

            if line.starts_with('#') {
                continue;
            }

            let lower = line.to_lowercase();

            if lower.starts_with("name:") {
                let value = self.header_value(line);
                self.macros.define("name", &value);
                name = Some(value);
            } else if lower.starts_with("version:") {
                let value = self.header_value(line);
                self.macros.define("version", &value);
                version = Some(value);
            } else if lower.starts_with("release:") {
                // Drop the dist macro suffix: "1%{?dist}" -> "1"
                let value = self.header_value(line);
                release = Some(value.split('%').next().unwrap_or("").to_string());
            } else if lower.starts_with("epoch:") {
                epoch = self.header_value(line).parse().ok();
            } else if lower.starts_with("buildrequires:") {
                build_requires.extend(self.parse_build_requires(line));
            } else if is_source_header(&lower) {
                let value = self.header_value(line);
                if !value.is_empty() {
                    source_urls.push(value);
                }
            }
        }

        for macro_name in &self.unresolved {
            warn!("unresolved macro in spec: %{{{}}}", macro_name);
        }

        let name =
            name.ok_or_else(|| DepforgeError::spec_parse("could not find Name in spec file"))?;
        let version =
            version.ok_or_else(|| DepforgeError::spec_parse("could not find Version in spec file"))?;
        if name.is_empty() {
            return Err(DepforgeError::spec_parse("empty Name header"));
        }
        if version.is_empty() {
            return Err(DepforgeError::spec_parse("empty Version header"));
        }

        Ok(PackageInfo {
            name,
            version,
            release: release.filter(|r| !r.is_empty()).unwrap_or_else(|| "1".to_string()),
            epoch,
            build_requires,
            source_urls,
        })
    }

    /// Macro names the last parse could not expand
    pub fn unresolved_macros(&self) -> &[String] {
        &self.unresolved
    }

    /// Extract and expand the value after the `Header:` prefix
    fn header_value(&mut self, line: &str) -> String {
        let value = match line.split_once(':') {
            Some((_, rest)) => rest.trim(),
            None => return String::new(),
        };
        self.macros.expand_tracking(value, &mut self.unresolved)
    }

    /// Parse one BuildRequires line into requirements.
    ///
    /// The value is a comma- and whitespace-separated token list; version
    /// constraints appear inline (`pkg>=1.2`) or space-separated
    /// (`pkg >= 1.2`). Virtual-provide tokens are preserved raw.
    fn parse_build_requires(&self, line: &str) -> Vec<BuildRequirement> {
        let value = match line.split_once(':') {
            Some((_, rest)) => rest.trim(),
            None => return Vec::new(),
        };

        let mut requirements = Vec::new();

        for chunk in value.split(',') {
            let tokens: Vec<&str> = chunk.split_whitespace().collect();

            let mut i = 0;
            while i < tokens.len() {
                let token = tokens[i];

                if let Some((name, op, version)) = split_inline_constraint(token) {
                    requirements.push(BuildRequirement::versioned(name, op, version));
                    i += 1;
                    continue;
                }

                // Space-separated constraint: "pkg >= 1.2"
                if let Some(op) = tokens.get(i + 1).and_then(|t| ReqOperator::parse(t)) {
                    if let Some(version) = tokens.get(i + 2) {
                        requirements.push(BuildRequirement::versioned(token, op, *version));
                        i += 3;
                        continue;
                    }
                }

                if !token.is_empty() {
                    requirements.push(BuildRequirement::plain(token));
                }
                i += 1;
            }
        }

        requirements
    }
}

impl Default for SpecAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Matches `source:`, `source0:` ... `sourceN:` headers
fn is_source_header(lower_line: &str) -> bool {
    let Some(prefix) = lower_line.split(':').next() else {
        return false;
    };
    let Some(digits) = prefix.strip_prefix("source") else {
        return false;
    };
    digits.chars().all(|c| c.is_ascii_digit())
}

/// Split `pkg>=1.2` style tokens; returns None for plain names.
///
/// The scan starts at the first operator character so names containing
/// `-` or parentheses pass through untouched.
fn split_inline_constraint(token: &str) -> Option<(&str, ReqOperator, &str)> {
    let idx = token.find(|c| c == '<' || c == '>' || c == '=' || c == '~')?;
    if idx == 0 {
        return None;
    }

    let (name, rest) = token.split_at(idx);
    for op_token in OPERATOR_TOKENS {
        if let Some(version) = rest.strip_prefix(op_token) {
            if version.is_empty() {
                return None;
            }
            let op = ReqOperator::parse(op_token)?;
            return Some((name, op, version));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SPEC: &str = r#"
Name:           mypackage
Version:        2.1.0
Release:        3%{?dist}
Epoch:          1
Summary:        A sample package

Source0:        https://example.com/%{name}-%{version}.tar.gz
Source1:        mypackage.conf

BuildRequires:  gcc, make
BuildRequires:  python3-devel >= 3.12
BuildRequires:  pkgconfig(glib-2.0)
"#;

    #[test]
    fn test_analyze_sample_spec() {
        let mut analyzer = SpecAnalyzer::new();
        let info = analyzer.analyze(SAMPLE_SPEC).unwrap();

        assert_eq!(info.name, "mypackage");
        assert_eq!(info.version, "2.1.0");
        assert_eq!(info.release, "3");
        assert_eq!(info.epoch, Some(1));
        assert_eq!(info.nvr(), "mypackage-2.1.0-3");

        assert_eq!(
            info.source_urls,
            vec![
                "https://example.com/mypackage-2.1.0.tar.gz".to_string(),
                "mypackage.conf".to_string(),
            ]
        );

        let names: Vec<String> = info.build_requires.iter().map(|r| r.name.clone()).collect();
        assert_eq!(
            names,
            vec!["gcc", "make", "python3-devel", "pkgconfig(glib-2.0)"]
        );
    }

    #[test]
    fn test_versioned_requirement() {
        let mut analyzer = SpecAnalyzer::new();
        let info = analyzer.analyze(SAMPLE_SPEC).unwrap();

        let py = info
            .build_requires
            .iter()
            .find(|r| r.name == "python3-devel")
            .unwrap();
        assert_eq!(py.operator, Some(ReqOperator::Ge));
        assert_eq!(py.version.as_deref(), Some("3.12"));
        assert_eq!(py.to_string(), "python3-devel >= 3.12");
    }

    #[test]
    fn test_inline_constraint() {
        let mut analyzer = SpecAnalyzer::new();
        let info = analyzer
            .analyze("Name: x\nVersion: 1\nBuildRequires: cmake>=3.20 ninja-build\n")
            .unwrap();

        assert_eq!(
            info.build_requires,
            vec![
                BuildRequirement::versioned("cmake", ReqOperator::Ge, "3.20"),
                BuildRequirement::plain("ninja-build"),
            ]
        );
    }

    #[test]
    fn test_double_equals_normalizes() {
        let req = BuildRequirement::parse("foo == 1.0").unwrap();
        assert_eq!(req.operator, Some(ReqOperator::Eq));
        assert_eq!(req.to_string(), "foo = 1.0");
    }

    #[test]
    fn test_requirement_roundtrip() {
        for input in [
            "gcc",
            "python3-devel >= 3.12",
            "glibc = 2.39",
            "rust ~= 1.70",
            "perl(File::Path)",
        ] {
            let req = BuildRequirement::parse(input).unwrap();
            let rendered = req.to_string();
            let again = BuildRequirement::parse(&rendered).unwrap();
            assert_eq!(req, again);
            assert_eq!(rendered, input);
        }
    }

    #[test]
    fn test_missing_name_fails() {
        let mut analyzer = SpecAnalyzer::new();
        let err = analyzer.analyze("Version: 1.0\n").unwrap_err();
        assert!(matches!(err, DepforgeError::SpecParse { .. }));
    }

    #[test]
    fn test_missing_version_fails() {
        let mut analyzer = SpecAnalyzer::new();
        let err = analyzer.analyze("Name: foo\n").unwrap_err();
        assert!(matches!(err, DepforgeError::SpecParse { .. }));
    }

    #[test]
    fn test_release_defaults_to_one() {
        let mut analyzer = SpecAnalyzer::new();
        let info = analyzer.analyze("Name: foo\nVersion: 1.0\n").unwrap();
        assert_eq!(info.release, "1");
    }

    #[test]
    fn test_comments_skipped() {
        let mut analyzer = SpecAnalyzer::new();
        let info = analyzer
            .analyze("# BuildRequires: not-real\nName: foo\nVersion: 1.0\n")
            .unwrap();
        assert!(info.build_requires.is_empty());
    }

    #[test]
    fn test_macro_token_preserved_raw() {
        let mut analyzer = SpecAnalyzer::new();
        let info = analyzer
            .analyze("Name: x\nVersion: 1\nBuildRequires: %{unknown_thing}-devel\n")
            .unwrap();
        assert_eq!(info.build_requires[0].name, "%{unknown_thing}-devel");
    }

    #[test]
    fn test_case_insensitive_headers() {
        let mut analyzer = SpecAnalyzer::new();
        let info = analyzer
            .analyze("NAME: foo\nVERSION: 1.0\nbuildrequires: bar\n")
            .unwrap();
        assert_eq!(info.name, "foo");
        assert_eq!(info.build_requires[0].name, "bar");
    }
}
