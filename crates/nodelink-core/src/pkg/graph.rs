//! Project dependency graph.
//!
//! Nodes live in an index (`Vec<GraphNode>` plus an identity lookup) and
//! refer to each other by `NodeIndex`, never by reference. The graph is a
//! DAG in the common case but cycles are allowed; every traversal keeps a
//! visited set so diamonds are walked once and cycles terminate.
//!
//! Whether a package is installed is a derived property: a node counts
//! only while it is reachable from a root. Removing a root never touches
//! other nodes directly; `orphans` diffs reachability before and after.

use super::error::PkgError;
use super::identity::PackageIdentity;
use super::lockfile::{codes as lock_codes, Lockfile};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Position of a node in the graph's index.
pub type NodeIndex = usize;

/// One installed package within a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub identity: PackageIdentity,
    /// Resolved runtime dependencies.
    pub children: Vec<NodeIndex>,
    /// Declared executables (name -> path inside the package).
    pub bin: BTreeMap<String, String>,
}

/// A dependency declared directly by the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDep {
    pub node: NodeIndex,
    /// Range as written in the project manifest.
    pub range: String,
    /// "dep", "dev", or "optional".
    pub kind: String,
}

/// A root to build a graph from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSpec {
    pub identity: PackageIdentity,
    pub range: String,
    pub kind: String,
}

/// A resolved package handed to [`DependencyGraph::build`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub dependencies: Vec<PackageIdentity>,
    pub bin: BTreeMap<String, String>,
}

/// All resolved packages by identity.
pub type ResolvedPackages = BTreeMap<PackageIdentity, ResolvedPackage>;

/// Where a `.bin` entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinTarget {
    pub owner: PackageIdentity,
    /// Path of the executable inside the owner's package directory.
    pub path: String,
}

/// A project's dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<PackageIdentity, NodeIndex>,
    roots: BTreeMap<String, RootDep>,
}

impl DependencyGraph {
    /// An empty graph (no roots, no nodes).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the graph reachable from `roots`.
    ///
    /// Packages in `packages` that no root reaches are not added.
    ///
    /// # Errors
    /// Returns `PKG_GRAPH_INTEGRITY` if a root or a dependency edge names
    /// an identity missing from `packages`.
    pub fn build(roots: &[RootSpec], packages: &ResolvedPackages) -> Result<Self, PkgError> {
        let mut graph = Self::default();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();

        for root in roots {
            if !packages.contains_key(&root.identity) {
                return Err(PkgError::graph_integrity(format!(
                    "Root dependency {} has no resolved package",
                    root.identity
                )));
            }
            let (node, inserted) = graph.intern(&root.identity, packages);
            if inserted {
                queue.push_back(node);
            }
            graph.roots.insert(
                root.identity.name.clone(),
                RootDep {
                    node,
                    range: root.range.clone(),
                    kind: root.kind.clone(),
                },
            );
        }

        // BFS; `intern` reports first insertion, which doubles as the visited check
        while let Some(node) = queue.pop_front() {
            let identity = graph.nodes[node].identity.clone();
            let resolved = &packages[&identity];
            let mut children = Vec::with_capacity(resolved.dependencies.len());

            for dep in &resolved.dependencies {
                if !packages.contains_key(dep) {
                    return Err(PkgError::graph_integrity(format!(
                        "{identity} depends on {dep}, which has no resolved package"
                    )));
                }
                let (child, inserted) = graph.intern(dep, packages);
                if inserted {
                    queue.push_back(child);
                }
                if !children.contains(&child) {
                    children.push(child);
                }
            }

            graph.nodes[node].children = children;
        }

        Ok(graph)
    }

    /// Build the graph recorded in a lockfile.
    ///
    /// # Errors
    /// Returns an error if a key is not a valid identity, disagrees with
    /// its entry's resolution, or an edge points outside the lockfile.
    pub fn from_lockfile(lockfile: &Lockfile) -> Result<Self, PkgError> {
        let mut packages = ResolvedPackages::new();

        for (key, pkg) in &lockfile.packages {
            let identity = PackageIdentity::parse_key(key).map_err(|e| {
                PkgError::new(lock_codes::PKG_LOCK_INVALID_KEY, e.message().to_string())
            })?;
            if !pkg.is_keyed_by(&identity)? {
                return Err(PkgError::new(
                    lock_codes::PKG_LOCK_INVALID_KEY,
                    format!("Lockfile key '{key}' does not match its version or resolution"),
                ));
            }

            let dependencies = pkg
                .dependencies
                .iter()
                .map(|(name, reference)| PackageIdentity::from_reference(name, reference))
                .collect::<Result<Vec<_>, _>>()?;

            packages.insert(
                identity,
                ResolvedPackage {
                    dependencies,
                    bin: pkg.bin.clone(),
                },
            );
        }

        let roots = lockfile
            .dependencies
            .iter()
            .map(|(name, dep)| {
                Ok(RootSpec {
                    identity: PackageIdentity::from_reference(name, &dep.resolved)?,
                    range: dep.range.clone(),
                    kind: dep.kind.clone(),
                })
            })
            .collect::<Result<Vec<_>, PkgError>>()?;

        Self::build(&roots, &packages)
    }

    /// Insert `identity` if absent. Returns its index and whether it was new.
    fn intern(
        &mut self,
        identity: &PackageIdentity,
        packages: &ResolvedPackages,
    ) -> (NodeIndex, bool) {
        if let Some(&idx) = self.index.get(identity) {
            return (idx, false);
        }
        let idx = self.nodes.len();
        self.nodes.push(GraphNode {
            identity: identity.clone(),
            children: Vec::new(),
            bin: packages
                .get(identity)
                .map(|p| p.bin.clone())
                .unwrap_or_default(),
        });
        self.index.insert(identity.clone(), idx);
        (idx, true)
    }

    /// Indices reachable from any root, in BFS order.
    fn reachable_indices(&self) -> Vec<NodeIndex> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();

        for root in self.roots.values() {
            if !visited[root.node] {
                visited[root.node] = true;
                queue.push_back(root.node);
            }
        }

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &child in &self.nodes[node].children {
                if !visited[child] {
                    visited[child] = true;
                    queue.push_back(child);
                }
            }
        }

        order
    }

    /// Every identity reachable from a current root, deduplicated.
    #[must_use]
    pub fn reachable_set(&self) -> BTreeSet<PackageIdentity> {
        self.reachable_indices()
            .into_iter()
            .map(|i| self.nodes[i].identity.clone())
            .collect()
    }

    /// A copy of this graph without the named roots.
    ///
    /// Only root marks are removed; nodes stay in the index until
    /// [`retain_reachable`](Self::retain_reachable). Names that are not
    /// roots are ignored.
    #[must_use]
    pub fn remove_roots(&self, names: &[String]) -> Self {
        let mut next = self.clone();
        for name in names {
            next.roots.remove(name);
        }
        next
    }

    /// Identities reachable in `before` but not in `after`.
    #[must_use]
    pub fn orphans(before: &Self, after: &Self) -> BTreeSet<PackageIdentity> {
        let still_needed = after.reachable_set();
        before
            .reachable_set()
            .into_iter()
            .filter(|id| !still_needed.contains(id))
            .collect()
    }

    /// Drop every node no root reaches, compacting the index.
    ///
    /// Returns the identities that were dropped.
    pub fn retain_reachable(&mut self) -> BTreeSet<PackageIdentity> {
        let keep = self.reachable_indices();
        let mut remap: HashMap<NodeIndex, NodeIndex> = HashMap::with_capacity(keep.len());
        for (new_idx, &old_idx) in keep.iter().enumerate() {
            remap.insert(old_idx, new_idx);
        }

        let dropped: BTreeSet<PackageIdentity> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !remap.contains_key(i))
            .map(|(_, n)| n.identity.clone())
            .collect();

        let mut nodes = Vec::with_capacity(keep.len());
        for &old_idx in &keep {
            let mut node = self.nodes[old_idx].clone();
            // Children of a reachable node are reachable, so the remap is total
            node.children = node.children.iter().map(|c| remap[c]).collect();
            nodes.push(node);
        }

        for root in self.roots.values_mut() {
            root.node = remap[&root.node];
        }
        self.index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.identity.clone(), i))
            .collect();
        self.nodes = nodes;

        dropped
    }

    /// Root dependencies by name.
    #[must_use]
    pub fn roots(&self) -> &BTreeMap<String, RootDep> {
        &self.roots
    }

    /// Whether `name` is a root of this graph.
    #[must_use]
    pub fn has_root(&self, name: &str) -> bool {
        self.roots.contains_key(name)
    }

    /// Identity installed for the root `name`.
    #[must_use]
    pub fn root_identity(&self, name: &str) -> Option<&PackageIdentity> {
        self.roots.get(name).map(|r| &self.nodes[r.node].identity)
    }

    /// Whether `identity` is the target of some root.
    #[must_use]
    pub fn is_root(&self, identity: &PackageIdentity) -> bool {
        self.index
            .get(identity)
            .is_some_and(|idx| self.roots.values().any(|r| r.node == *idx))
    }

    /// Look up a node by identity.
    #[must_use]
    pub fn node(&self, identity: &PackageIdentity) -> Option<&GraphNode> {
        self.index.get(identity).map(|&i| &self.nodes[i])
    }

    /// Identities of a node's children.
    #[must_use]
    pub fn children_of(&self, identity: &PackageIdentity) -> Vec<&PackageIdentity> {
        self.node(identity)
            .map(|n| n.children.iter().map(|&c| &self.nodes[c].identity).collect())
            .unwrap_or_default()
    }

    /// Number of nodes in the index (reachable or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Which reachable package owns each `.bin` name.
    ///
    /// When several packages declare the same executable, a root's
    /// declaration beats a transitive one; among equals the smallest
    /// identity wins, so the result does not depend on traversal order.
    #[must_use]
    pub fn bin_owners(&self) -> BTreeMap<String, BinTarget> {
        let mut owners: BTreeMap<String, (bool, BinTarget)> = BTreeMap::new();

        for idx in self.reachable_indices() {
            let node = &self.nodes[idx];
            if node.bin.is_empty() {
                continue;
            }
            let is_root = self.roots.values().any(|r| r.node == idx);

            for (name, path) in &node.bin {
                let candidate = BinTarget {
                    owner: node.identity.clone(),
                    path: path.clone(),
                };
                let replace = match owners.get(name) {
                    None => true,
                    Some((cur_root, cur)) => {
                        (is_root && !cur_root)
                            || (is_root == *cur_root && candidate.owner < cur.owner)
                    }
                };
                if replace {
                    owners.insert(name.clone(), (is_root, candidate));
                }
            }
        }

        owners.into_iter().map(|(k, (_, t))| (k, t)).collect()
    }
}
