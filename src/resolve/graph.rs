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

//! Dependency graph construction, cycle detection, and build leveling.

use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::names::NameResolver;
use crate::error::{DepforgeError, DepforgeResult};
use crate::spec::PackageInfo;

/// Node in the dependency graph.
///
/// Edges are package names, never references, so the graph stays a flat
/// map and cycles cannot leak into ownership.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub name: String,
    pub srpm_path: Option<PathBuf>,
    pub info: Option<PackageInfo>,
    pub dependencies: BTreeSet<String>,
    pub is_available: bool,
    pub build_order: i32,
}

impl DependencyNode {
    /// Node for a package that has to be built
    pub fn pending(name: impl Into<String>, srpm_path: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            srpm_path,
            info: None,
            dependencies: BTreeSet::new(),
            is_available: false,
            build_order: -1,
        }
    }

    /// Node for a package already tagged in the hub
    pub fn available(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            srpm_path: None,
            info: None,
            dependencies: BTreeSet::new(),
            is_available: true,
            build_order: -1,
        }
    }
}

/// Dependency graph keyed by package name
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, DependencyNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, node: DependencyNode) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn get(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Packages that still have to be built
    pub fn missing(&self) -> Vec<&DependencyNode> {
        self.nodes.values().filter(|n| !n.is_available).collect()
    }

    /// Kahn's algorithm over the unavailable subgraph.
    ///
    /// Ties break in lexicographic name order so two runs over the same
    /// hub state produce identical output. Leftover nodes mean a cycle.
    pub fn topological_sort(&self) -> DepforgeResult<Vec<String>> {
        let pending: BTreeSet<&str> = self
            .nodes
            .values()
            .filter(|n| !n.is_available)
            .map(|n| n.name.as_str())
            .collect();

        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for name in &pending {
            let node = &self.nodes[*name];
            let degree = node
                .dependencies
                .iter()
                .filter(|d| pending.contains(d.as_str()))
                .count();
            in_degree.insert(*name, degree);

            for dep in &node.dependencies {
                if pending.contains(dep.as_str()) {
                    dependents.entry(dep.as_str()).or_default().push(*name);
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut sorted = Vec::new();
        while let Some(&name) = ready.iter().next() {
            ready.remove(name);
            sorted.push(name.to_string());

            for dependent in dependents.get(name).into_iter().flatten() {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*dependent);
                }
            }
        }

        if sorted.len() < pending.len() {
            let sorted_set: HashSet<&str> = sorted.iter().map(|s| s.as_str()).collect();
            let cycle: Vec<String> = pending
                .iter()
                .filter(|n| !sorted_set.contains(**n))
                .map(|n| n.to_string())
                .collect();
            return Err(DepforgeError::CircularDependency { cycle });
        }

        Ok(sorted)
    }

    /// Group the unavailable nodes into parallel build levels.
    ///
    /// A node's level is one past the deepest of its unavailable
    /// dependencies; leaves sit at level 0 and the root necessarily forms
    /// the final singleton level. Assigns `build_order` on every pending
    /// node as a side effect.
    pub fn build_chain(&mut self) -> DepforgeResult<Vec<Vec<String>>> {
        let sorted = self.topological_sort()?;
        if sorted.is_empty() {
            return Ok(Vec::new());
        }

        let mut levels: BTreeMap<String, i32> = BTreeMap::new();

        for name in &sorted {
            let node = &self.nodes[name];
            let level = node
                .dependencies
                .iter()
                .filter_map(|d| levels.get(d))
                .max()
                .map(|deepest| deepest + 1)
                .unwrap_or(0);
            levels.insert(name.clone(), level);
        }

        for (name, level) in &levels {
            if let Some(node) = self.nodes.get_mut(name) {
                node.build_order = *level;
            }
        }

        let max_level = levels.values().copied().max().unwrap_or(0);
        let mut chain: Vec<Vec<String>> = vec![Vec::new(); (max_level + 1) as usize];
        for (name, level) in levels {
            chain[level as usize].push(name);
        }

        Ok(chain.into_iter().filter(|level| !level.is_empty()).collect())
    }
}

/// Builds the dependency graph for a root SRPM.
///
/// Collaborators are injected as callables: `available` answers hub tag
/// membership, `requires_of` extracts build requirements from an SRPM,
/// and `fetch` resolves a package name to a local SRPM path.
pub struct DependencyResolver<'a> {
    names: &'a NameResolver,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(names: &'a NameResolver) -> Self {
        Self { names }
    }

    pub async fn build_graph(
        &self,
        root_name: &str,
        root_srpm: &Path,
        available: &dyn Fn(&str) -> DepforgeResult<bool>,
        requires_of: &dyn Fn(&Path) -> DepforgeResult<Vec<String>>,
        fetch: &mut dyn FnMut(&str) -> BoxFuture<'static, DepforgeResult<PathBuf>>,
    ) -> DepforgeResult<DependencyGraph> {
        let mut graph = DependencyGraph::new();
        let mut queue: VecDeque<(String, PathBuf)> = VecDeque::new();

        graph.insert(DependencyNode::pending(
            root_name,
            Some(root_srpm.to_path_buf()),
        ));
        queue.push_back((root_name.to_string(), root_srpm.to_path_buf()));

        while let Some((name, srpm_path)) = queue.pop_front() {
            let tokens = requires_of(&srpm_path)?;
            debug!("{}: {} build requirements", name, tokens.len());

            let mut missing = BTreeSet::new();

            for token in tokens {
                // A token the pipeline cannot name falls back to itself
                let canonical = match self.names.resolve_checked(&token) {
                    Ok(canonical) => canonical,
                    Err(e) => {
                        warn!("{}; treating the original token as the name", e);
                        token.clone()
                    }
                };

                // Canonical form wins if the tag has it; otherwise fall
                // back to probing the original token
                let satisfied = if available(&canonical)? {
                    Some(canonical.clone())
                } else if canonical != token && available(&token)? {
                    Some(token.clone())
                } else {
                    None
                };

                match satisfied {
                    Some(tagged) => {
                        if !graph.contains(&tagged) {
                            graph.insert(DependencyNode::available(tagged));
                        }
                    }
                    None => {
                        missing.insert(canonical);
                    }
                }
            }

            if !missing.is_empty() {
                info!("{}: missing dependencies: {:?}", name, missing);
            }

            for dep in &missing {
                if !graph.contains(dep) {
                    let dep_srpm = fetch(dep).await?;
                    graph.insert(DependencyNode::pending(dep, Some(dep_srpm.clone())));
                    queue.push_back((dep.clone(), dep_srpm));
                }
            }

            if let Some(node) = graph.nodes.get_mut(&name) {
                node.dependencies.extend(missing);
            }
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NameResolutionMode;
    use std::collections::{HashMap, HashSet};

    fn resolver_fixture() -> NameResolver {
        NameResolver::new(NameResolutionMode::RulesOnly, None)
    }

    /// Build a graph from requirement and availability tables
    async fn graph_from_tables(
        root: &str,
        requires: &HashMap<&str, Vec<&str>>,
        tagged: &[&str],
    ) -> DepforgeResult<DependencyGraph> {
        use futures::FutureExt;

        let names = resolver_fixture();
        let resolver = DependencyResolver::new(&names);

        let requires_owned: HashMap<String, Vec<String>> = requires
            .iter()
            .map(|(k, v)| {
                (
                    format!("/srpms/{}.src.rpm", k),
                    v.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect();
        let tagged: HashSet<String> = tagged.iter().map(|s| s.to_string()).collect();

        let available = move |name: &str| Ok(tagged.contains(name));
        let requires_of = move |path: &Path| {
            Ok(requires_owned
                .get(path.to_str().unwrap())
                .cloned()
                .unwrap_or_default())
        };
        let mut fetch = |name: &str| {
            let path = PathBuf::from(format!("/srpms/{}.src.rpm", name));
            async move { Ok(path) }.boxed()
        };

        resolver
            .build_graph(
                root,
                Path::new(&format!("/srpms/{}.src.rpm", root)),
                &available,
                &requires_of,
                &mut fetch,
            )
            .await
    }

    #[tokio::test]
    async fn test_leveling_scenario() {
        // my-app -> {lib-foo, lib-bar, lib-baz}; lib-foo -> lib-base;
        // lib-baz -> lib-core; hub already has lib-bar/lib-base/lib-core
        let mut requires = HashMap::new();
        requires.insert("my-app", vec!["lib-foo", "lib-bar", "lib-baz"]);
        requires.insert("lib-foo", vec!["lib-base"]);
        requires.insert("lib-baz", vec!["lib-core"]);

        let mut graph =
            graph_from_tables("my-app", &requires, &["lib-bar", "lib-base", "lib-core"])
                .await
                .unwrap();

        for tagged in ["lib-bar", "lib-base", "lib-core"] {
            assert!(graph.get(tagged).unwrap().is_available);
        }

        let chain = graph.build_chain().unwrap();
        assert_eq!(
            chain,
            vec![
                vec!["lib-baz".to_string(), "lib-foo".to_string()],
                vec!["my-app".to_string()],
            ]
        );

        assert_eq!(graph.get("lib-foo").unwrap().build_order, 0);
        assert_eq!(graph.get("my-app").unwrap().build_order, 1);
    }

    #[tokio::test]
    async fn test_cycle_detection() {
        let mut requires = HashMap::new();
        requires.insert("pkg-a", vec!["pkg-b"]);
        requires.insert("pkg-b", vec!["pkg-a"]);

        let graph = graph_from_tables("pkg-a", &requires, &[]).await.unwrap();
        let err = graph.topological_sort().unwrap_err();

        match err {
            DepforgeError::CircularDependency { cycle } => {
                assert_eq!(cycle, vec!["pkg-a".to_string(), "pkg-b".to_string()]);
            }
            other => panic!("expected CircularDependency, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_nodes_carry_srpm_paths() {
        let mut requires = HashMap::new();
        requires.insert("top", vec!["mid"]);
        requires.insert("mid", vec![]);

        let graph = graph_from_tables("top", &requires, &[]).await.unwrap();

        for node in graph.missing() {
            assert!(
                node.srpm_path.is_some(),
                "pending node {} has no SRPM",
                node.name
            );
        }
    }

    #[tokio::test]
    async fn test_virtual_provides_canonicalized() {
        let mut requires = HashMap::new();
        requires.insert("app", vec!["python3dist(requests)", "pkgconfig(glib-2.0)"]);
        requires.insert("python3-requests", vec![]);

        let graph =
            graph_from_tables("app", &requires, &["glib-2.0-devel"]).await.unwrap();

        // pkgconfig dep was satisfied under its canonical name
        assert!(graph.get("glib-2.0-devel").unwrap().is_available);
        // python dep was missing and fetched under its canonical name
        assert!(!graph.get("python3-requests").unwrap().is_available);
        assert!(graph
            .get("app")
            .unwrap()
            .dependencies
            .contains("python3-requests"));
    }

    #[tokio::test]
    async fn test_original_token_fallback() {
        // Canonical form absent from the tag, original token present
        let mut requires = HashMap::new();
        requires.insert("app", vec!["weird(provide)"]);

        let graph = graph_from_tables("app", &requires, &["weird(provide)"]).await.unwrap();
        assert!(graph.get("weird(provide)").unwrap().is_available);
        assert!(graph.get("app").unwrap().dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        use futures::FutureExt;

        let names = resolver_fixture();
        let resolver = DependencyResolver::new(&names);

        let available = |_: &str| Ok(false);
        let requires_of = |_: &Path| Ok(vec!["gone".to_string()]);
        let mut fetch = |name: &str| {
            let name = name.to_string();
            async move {
                Err(DepforgeError::SrpmNotFound {
                    package: name,
                    detail: "all sources exhausted".to_string(),
                })
            }
            .boxed()
        };

        let err = resolver
            .build_graph(
                "app",
                Path::new("/srpms/app.src.rpm"),
                &available,
                &requires_of,
                &mut fetch,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DepforgeError::SrpmNotFound { .. }));
    }

    #[tokio::test]
    async fn test_diamond_levels() {
        // top -> {left, right}; left -> base; right -> base
        let mut requires = HashMap::new();
        requires.insert("top", vec!["left", "right"]);
        requires.insert("left", vec!["base"]);
        requires.insert("right", vec!["base"]);
        requires.insert("base", vec![]);

        let mut graph = graph_from_tables("top", &requires, &[]).await.unwrap();
        let chain = graph.build_chain().unwrap();

        assert_eq!(
            chain,
            vec![
                vec!["base".to_string()],
                vec!["left".to_string(), "right".to_string()],
                vec!["top".to_string()],
            ]
        );
    }

    #[test]
    fn test_empty_graph_chain() {
        let mut graph = DependencyGraph::new();
        assert!(graph.build_chain().unwrap().is_empty());
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn test_build_order_respects_edges() {
        let mut requires = HashMap::new();
        requires.insert("app", vec!["lib-a", "lib-b"]);
        requires.insert("lib-a", vec!["lib-c"]);
        requires.insert("lib-b", vec!["lib-c"]);
        requires.insert("lib-c", vec![]);

        let mut graph = graph_from_tables("app", &requires, &[]).await.unwrap();
        graph.build_chain().unwrap();

        // Every dependency is ordered strictly before its dependent,
        // and leaves sit at level zero
        for node in graph.nodes() {
            if node.dependencies.is_empty() {
                assert_eq!(node.build_order, 0, "leaf {} not at level 0", node.name);
            }
            for dep in &node.dependencies {
                let dep_order = graph.get(dep).unwrap().build_order;
                assert!(
                    dep_order < node.build_order,
                    "{} (level {}) not before {} (level {})",
                    dep,
                    dep_order,
                    node.name,
                    node.build_order
                );
            }
        }
    }

    #[tokio::test]
    async fn test_determinism() {
        let mut requires = HashMap::new();
        requires.insert("root", vec!["zeta", "alpha", "mid"]);
        requires.insert("mid", vec!["alpha"]);

        let mut chains = Vec::new();
        for _ in 0..3 {
            let mut graph = graph_from_tables("root", &requires, &[]).await.unwrap();
            chains.push(graph.build_chain().unwrap());
        }

        assert_eq!(chains[0], chains[1]);
        assert_eq!(chains[1], chains[2]);
        // Intra-level order is lexicographic
        assert_eq!(chains[0][0], vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
