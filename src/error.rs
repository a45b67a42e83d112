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

//! Hierarchical error types for every failure class in the build pipeline.

use std::fmt;
use thiserror::Error;

/// Main error type for depforge operations
#[derive(Debug, Error)]
pub enum DepforgeError {
    /// SRPM file is missing, malformed, or not a source RPM
    #[error("Invalid SRPM '{path}': {reason}")]
    InvalidSrpm { path: String, reason: String },

    /// Spec file is missing a required header or cannot be parsed
    #[error("Spec parse error: {reason}")]
    SpecParse { reason: String },

    /// Name canonicalization pipeline exhausted with no result
    #[error("Could not resolve package name for '{token}'")]
    NameResolution { token: String },

    /// Every (candidate name, source) combination failed
    #[error("Could not find SRPM for '{package}': {detail}")]
    SrpmNotFound { package: String, detail: String },

    /// Network errors during downloads
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// DAG construction left nodes with unresolvable ordering
    #[error("Circular dependency detected involving: {}", .cycle.join(", "))]
    CircularDependency { cycle: Vec<String> },

    /// Koji CLI missing, transport failure, or authentication failure
    #[error("Koji connection error: {context}")]
    KojiConnection { context: String },

    /// Koji reported a build failure
    #[error("Build failed for '{package}' ({kind}): {detail}")]
    KojiBuild {
        package: String,
        kind: BuildErrorKind,
        detail: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// File system errors
    #[error("File system error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// What went wrong with a Koji build task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorKind {
    SubmitFailed,
    TaskFailed,
    Timeout,
    Canceled,
}

impl fmt::Display for BuildErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildErrorKind::SubmitFailed => write!(f, "submit-failed"),
            BuildErrorKind::TaskFailed => write!(f, "task-failed"),
            BuildErrorKind::Timeout => write!(f, "timeout"),
            BuildErrorKind::Canceled => write!(f, "canceled"),
        }
    }
}

impl DepforgeError {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            DepforgeError::KojiConnection { context } => {
                // Authentication problems never fix themselves
                !context.to_lowercase().contains("auth")
            }
            DepforgeError::KojiBuild { kind, .. } => *kind == BuildErrorKind::SubmitFailed,
            DepforgeError::Network { .. } => true,
            _ => false,
        }
    }

    /// Process exit code for the error category
    pub fn exit_code(&self) -> i32 {
        match self {
            DepforgeError::InvalidSrpm { .. } | DepforgeError::SpecParse { .. } => 2,
            DepforgeError::SrpmNotFound { .. } | DepforgeError::Network { .. } => 3,
            DepforgeError::CircularDependency { .. } => 4,
            DepforgeError::KojiConnection { .. } => 5,
            _ => 1,
        }
    }

    /// Create an invalid-SRPM error
    pub fn invalid_srpm(path: impl Into<String>, reason: impl Into<String>) -> Self {
        DepforgeError::InvalidSrpm {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a spec-parse error
    pub fn spec_parse(reason: impl Into<String>) -> Self {
        DepforgeError::SpecParse {
            reason: reason.into(),
        }
    }

    /// Create a Koji connection error
    pub fn koji_connection(context: impl Into<String>) -> Self {
        DepforgeError::KojiConnection {
            context: context.into(),
        }
    }

    /// Create an I/O error with path context
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        DepforgeError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for depforge operations
pub type DepforgeResult<T> = std::result::Result<T, DepforgeError>;
