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

//! SRPM header queries and embedded-spec extraction via the host RPM tools.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use super::analyzer::{PackageInfo, SpecAnalyzer};
use crate::error::{DepforgeError, DepforgeResult};

/// Lead magic of every RPM package file
const RPM_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];

// Operators stripped off `rpm -qp --requires` output lines
const REQUIRES_OPERATORS: &[&str] = &[">=", "<=", "==", "~=", ">", "<", "="];

/// Validate that a path points at a readable source RPM
pub fn validate_srpm(srpm_path: &Path) -> DepforgeResult<()> {
    if !srpm_path.exists() {
        return Err(DepforgeError::invalid_srpm(
            srpm_path.display().to_string(),
            "file not found",
        ));
    }

    let file_name = srpm_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if !file_name.ends_with(".rpm") || !file_name.contains(".src.") {
        return Err(DepforgeError::invalid_srpm(
            srpm_path.display().to_string(),
            "not a .src.rpm file",
        ));
    }

    let mut magic = [0u8; 4];
    File::open(srpm_path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| DepforgeError::io(srpm_path.display().to_string(), e))?;

    if magic != RPM_MAGIC {
        return Err(DepforgeError::invalid_srpm(
            srpm_path.display().to_string(),
            "bad RPM magic number",
        ));
    }

    Ok(())
}

/// Build-time requirement tokens recorded in the SRPM header.
///
/// Runs `rpm -qp --requires`, strips version constraints, and drops
/// rpmlib() and file-path requirements.
pub fn build_requires(srpm_path: &Path) -> DepforgeResult<Vec<String>> {
    validate_srpm(srpm_path)?;

    let output = Command::new("rpm")
        .args(["-qp", "--requires"])
        .arg(srpm_path)
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DepforgeError::invalid_srpm(
                    srpm_path.display().to_string(),
                    "rpm not found; install the rpm package",
                )
            } else {
                DepforgeError::io("rpm".to_string(), e)
            }
        })?;

    if !output.status.success() {
        return Err(DepforgeError::invalid_srpm(
            srpm_path.display().to_string(),
            format!(
                "rpm query failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    Ok(parse_requires_output(&String::from_utf8_lossy(
        &output.stdout,
    )))
}

/// Full package information from an SRPM.
///
/// Unpacks the archive into a scratch directory that is removed on every
/// exit path, locates the embedded spec, and hands it to the analyzer.
pub fn package_info(srpm_path: &Path) -> DepforgeResult<PackageInfo> {
    validate_srpm(srpm_path)?;

    let scratch = tempfile::tempdir()
        .map_err(|e| DepforgeError::io("temporary directory".to_string(), e))?;

    unpack_srpm(srpm_path, scratch.path())?;

    let spec_path = find_spec_file(scratch.path())?.ok_or_else(|| {
        DepforgeError::invalid_srpm(srpm_path.display().to_string(), "no spec file in SRPM")
    })?;

    debug!("extracted spec: {}", spec_path.display());

    let mut analyzer = SpecAnalyzer::new();
    analyzer.analyze_file(&spec_path)
}

/// Unpack the SRPM payload into `dest` via `rpm2cpio | cpio`
fn unpack_srpm(srpm_path: &Path, dest: &Path) -> DepforgeResult<()> {
    let command = format!(
        "rpm2cpio '{}' | cpio -idm --quiet",
        srpm_path.display().to_string().replace('\'', r"'\''")
    );

    let status = Command::new("sh")
        .args(["-c", &command])
        .current_dir(dest)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DepforgeError::invalid_srpm(
                    srpm_path.display().to_string(),
                    "rpm2cpio/cpio not found; install the rpm and cpio packages",
                )
            } else {
                DepforgeError::io("rpm2cpio".to_string(), e)
            }
        })?;

    if !status.success() {
        return Err(DepforgeError::invalid_srpm(
            srpm_path.display().to_string(),
            "failed to extract SRPM payload",
        ));
    }

    Ok(())
}

/// Locate the single `*.spec` file in an unpacked SRPM
fn find_spec_file(dir: &Path) -> DepforgeResult<Option<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| DepforgeError::io(dir.display().to_string(), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| DepforgeError::io(dir.display().to_string(), e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("spec") {
            return Ok(Some(path));
        }
    }

    Ok(None)
}

/// Filter `rpm -qp --requires` output down to package name tokens
fn parse_requires_output(stdout: &str) -> Vec<String> {
    let mut requires = Vec::new();

    for line in stdout.lines() {
        let mut token = line.trim();
        if token.is_empty() {
            continue;
        }

        for op in REQUIRES_OPERATORS {
            if let Some(idx) = token.find(op) {
                token = token[..idx].trim();
                break;
            }
        }

        // Internal rpmlib capabilities and file-path deps are not packages
        if token.starts_with("rpmlib(") || token.starts_with('/') {
            continue;
        }

        if !token.is_empty() && !requires.iter().any(|r| r == token) {
            requires.push(token.to_string());
        }
    }

    requires
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_validate_missing_file() {
        let err = validate_srpm(Path::new("/nonexistent/foo-1.0-1.src.rpm")).unwrap_err();
        assert!(matches!(err, DepforgeError::InvalidSrpm { .. }));
    }

    #[test]
    fn test_validate_wrong_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foo-1.0-1.x86_64.rpm");
        std::fs::write(&path, b"whatever").unwrap();

        let err = validate_srpm(&path).unwrap_err();
        assert!(format!("{}", err).contains("not a .src.rpm"));
    }

    #[test]
    fn test_validate_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foo-1.0-1.src.rpm");
        std::fs::write(&path, b"not an rpm at all").unwrap();

        let err = validate_srpm(&path).unwrap_err();
        assert!(format!("{}", err).contains("magic"));
    }

    #[test]
    fn test_validate_good_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foo-1.0-1.src.rpm");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&RPM_MAGIC).unwrap();
        file.write_all(b"rest of header").unwrap();

        assert!(validate_srpm(&path).is_ok());
    }

    #[test]
    fn test_parse_requires_output() {
        let stdout = "\
gcc
python3-devel >= 3.12
rpmlib(CompressedFileNames) <= 3.0.4-1
/usr/bin/python3
pkgconfig(glib-2.0)
gcc
";
        let requires = parse_requires_output(stdout);
        assert_eq!(requires, vec!["gcc", "python3-devel", "pkgconfig(glib-2.0)"]);
    }

    #[test]
    fn test_parse_requires_strips_inline_constraint() {
        let requires = parse_requires_output("cmake>=3.20\n");
        assert_eq!(requires, vec!["cmake"]);
    }

    #[test]
    fn test_find_spec_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("sources"), "x").unwrap();
        assert!(find_spec_file(dir.path()).unwrap().is_none());

        std::fs::write(dir.path().join("foo.spec"), "Name: foo").unwrap();
        let found = find_spec_file(dir.path()).unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "foo.spec");
    }
}
