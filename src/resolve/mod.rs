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

//! Dependency resolution.
//!
//! - Canonicalization of virtual-provide tokens to real package names
//! - Optional similarity-model fallback for unknown provide dialects
//! - Dependency graph construction, cycle detection, and build leveling

pub mod graph;
pub mod ml;
pub mod names;

pub use graph::{DependencyGraph, DependencyNode, DependencyResolver};
pub use ml::MlResolver;
pub use names::NameResolver;
