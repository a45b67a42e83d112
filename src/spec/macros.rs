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

//! RPM macro expansion over a fixed table of system macros.

use regex::{Captures, Regex};
use std::collections::HashMap;

/// Maximum expansion passes for nested macros
const EXPANSION_DEPTH: usize = 8;

/// Well-known system macros as they are defined on a current Fedora
const SYSTEM_MACROS: &[(&str, &str)] = &[
    ("python3_pkgversion", "3"),
    ("python3_version", "3.12"),
    ("python3_version_nodots", "312"),
    ("__python3", "/usr/bin/python3"),
    ("python3_sitelib", "/usr/lib/python3.12/site-packages"),
    ("python3_sitearch", "/usr/lib64/python3.12/site-packages"),
    ("lua_version", "5.4"),
    ("ruby_version", "3.2"),
    ("_prefix", "/usr"),
    ("_bindir", "/usr/bin"),
    ("_libdir", "/usr/lib64"),
    ("_includedir", "/usr/include"),
    ("_datadir", "/usr/share"),
    ("_sysconfdir", "/etc"),
    ("_mandir", "/usr/share/man"),
    ("_infodir", "/usr/share/info"),
    ("_localstatedir", "/var"),
    ("_sharedstatedir", "/var/lib"),
];

/// Macro table with iterative `%{...}` / `%{?...}` / `%name` expansion
pub struct MacroTable {
    macros: HashMap<String, String>,
    braced: Regex,
    bare: Regex,
}

impl MacroTable {
    /// Create a table seeded with the system macros
    pub fn new() -> Self {
        let macros = SYSTEM_MACROS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            macros,
            braced: Regex::new(r"%\{([^{}]+)\}").unwrap(),
            bare: Regex::new(r"%([A-Za-z_][A-Za-z0-9_]*)").unwrap(),
        }
    }

    /// Define or override a macro (e.g. `name`/`version` from the spec itself)
    pub fn define(&mut self, name: &str, value: &str) {
        self.macros.insert(name.to_string(), value.to_string());
    }

    /// Expand macros in a value, ignoring unresolved ones
    pub fn expand(&self, value: &str) -> String {
        let mut unresolved = Vec::new();
        self.expand_tracking(value, &mut unresolved)
    }

    /// Expand macros, recording unknown non-optional macro names.
    ///
    /// Runs up to `EXPANSION_DEPTH` passes so nested definitions such as
    /// `%{python3_sitelib}` referencing `%{python3_version}` settle.
    /// `%{?name}` expands to the empty string on a miss; `%{?name:text}`
    /// expands to `text` on a hit and empty on a miss; unknown `%{name}`
    /// stays verbatim and is reported.
    pub fn expand_tracking(&self, value: &str, unresolved: &mut Vec<String>) -> String {
        if !value.contains('%') {
            return value.to_string();
        }

        let mut current = value.to_string();

        for _ in 0..EXPANSION_DEPTH {
            let mut missing = Vec::new();

            let pass = self
                .braced
                .replace_all(&current, |caps: &Captures| {
                    self.replace_braced(&caps[1], &mut missing)
                })
                .into_owned();

            let pass = self
                .bare
                .replace_all(&pass, |caps: &Captures| match self.macros.get(&caps[1]) {
                    Some(v) => v.clone(),
                    None => caps[0].to_string(),
                })
                .into_owned();

            let done = pass == current;
            current = pass;
            if done {
                for name in missing {
                    if !unresolved.contains(&name) {
                        unresolved.push(name);
                    }
                }
                break;
            }
        }

        current
    }

    fn replace_braced(&self, expr: &str, missing: &mut Vec<String>) -> String {
        if let Some(optional) = expr.strip_prefix('?') {
            // %{?name:text} keeps text on a hit; %{?name} substitutes the value
            return match optional.split_once(':') {
                Some((name, text)) => {
                    if self.macros.contains_key(name) {
                        text.to_string()
                    } else {
                        String::new()
                    }
                }
                None => self.macros.get(optional).cloned().unwrap_or_default(),
            };
        }

        match self.macros.get(expr) {
            Some(v) => v.clone(),
            None => {
                missing.push(expr.to_string());
                format!("%{{{}}}", expr)
            }
        }
    }
}

impl Default for MacroTable {
    fn default() -> Self {
        Self::new()
    }
}
