//! Application groups.
//!
//! A `Group` is the versioned tree of apps and subgroups. Root-group writes
//! are atomic with all referenced apps (see `berth-state`); this module only
//! carries the model and its structural validation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};
use crate::ids::AppId;
use crate::run_spec::RunSpec;
use crate::version::Timestamp;

/// A node of the application tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: AppId,
    pub apps: BTreeMap<AppId, RunSpec>,
    pub groups: BTreeMap<AppId, Group>,
    /// Dependencies of this group as a whole: every app below depends on
    /// every app below each referenced path.
    #[serde(default)]
    pub dependencies: Vec<AppId>,
    pub version: Timestamp,
}

impl Group {
    /// An empty group at `id`.
    pub fn empty(id: AppId, version: Timestamp) -> Self {
        Group {
            id,
            apps: BTreeMap::new(),
            groups: BTreeMap::new(),
            dependencies: Vec::new(),
            version,
        }
    }

    /// An empty root group.
    pub fn empty_root(version: Timestamp) -> Self {
        Self::empty(AppId::root(), version)
    }

    /// All run specs in this group and every subgroup.
    pub fn transitive_run_specs(&self) -> Vec<&RunSpec> {
        let mut specs: Vec<&RunSpec> = self.apps.values().collect();
        for group in self.groups.values() {
            specs.extend(group.transitive_run_specs());
        }
        specs
    }

    /// All app ids in this group and every subgroup.
    pub fn transitive_app_ids(&self) -> BTreeSet<AppId> {
        self.transitive_run_specs()
            .into_iter()
            .map(|spec| spec.id.clone())
            .collect()
    }

    /// Find an app anywhere in the tree.
    pub fn app(&self, id: &AppId) -> Option<&RunSpec> {
        if let Some(spec) = self.apps.get(id) {
            return Some(spec);
        }
        self.groups.values().find_map(|group| group.app(id))
    }

    /// Insert or replace an app, creating intermediate groups as needed.
    /// The group version is not touched; callers stamp the tree explicitly.
    pub fn put_app(&mut self, spec: RunSpec) {
        let parent = spec.id.parent();
        if parent == self.id {
            self.apps.insert(spec.id.clone(), spec);
            return;
        }
        // Descend one segment below this group towards the app.
        let child_id = child_towards(&self.id, &spec.id);
        let version = self.version;
        self.groups
            .entry(child_id.clone())
            .or_insert_with(|| Group::empty(child_id, version))
            .put_app(spec);
    }

    /// Remove an app anywhere in the tree; returns the removed spec.
    pub fn remove_app(&mut self, id: &AppId) -> Option<RunSpec> {
        if let Some(spec) = self.apps.remove(id) {
            return Some(spec);
        }
        self.groups
            .values_mut()
            .find_map(|group| group.remove_app(id))
    }

    /// Stamp this group and every subgroup with a new version.
    pub fn with_version(mut self, version: Timestamp) -> Group {
        self.version = version;
        self.groups = self
            .groups
            .into_iter()
            .map(|(id, group)| (id, group.with_version(version)))
            .collect();
        self
    }

    /// Structural validation: children are descendants of their parent,
    /// apps are unique across the tree, every app is valid, and the
    /// dependency graph is acyclic.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut seen = BTreeSet::new();
        self.validate_tree(&mut seen)?;
        self.validate_acyclic()
    }

    fn validate_tree(&self, seen: &mut BTreeSet<AppId>) -> ValidationResult<()> {
        for (id, spec) in &self.apps {
            if !id.is_descendant_of(&self.id) || *id == self.id {
                return Err(ValidationError::ChildOutsideParent(
                    self.id.to_string(),
                    id.to_string(),
                ));
            }
            if !seen.insert(id.clone()) {
                return Err(ValidationError::DuplicateApp(
                    self.id.to_string(),
                    id.to_string(),
                ));
            }
            spec.validate()?;
        }
        for (id, group) in &self.groups {
            if !id.is_descendant_of(&self.id) || *id == self.id {
                return Err(ValidationError::ChildOutsideParent(
                    self.id.to_string(),
                    id.to_string(),
                ));
            }
            group.validate_tree(seen)?;
        }
        Ok(())
    }

    /// Cycle detection over the app-level dependency graph. Group
    /// dependencies are expanded to edges onto every app below the target.
    fn validate_acyclic(&self) -> ValidationResult<()> {
        let specs = self.transitive_run_specs();
        let ids: BTreeSet<&AppId> = specs.iter().map(|spec| &spec.id).collect();

        let mut edges: HashMap<&AppId, Vec<&AppId>> = HashMap::new();
        for spec in &specs {
            let targets: Vec<&AppId> = spec
                .dependencies
                .iter()
                .flat_map(|dep| {
                    ids.iter()
                        .copied()
                        .filter(move |id| id.is_descendant_of(dep))
                })
                .collect();
            edges.insert(&spec.id, targets);
        }
        self.collect_group_dependency_edges(&ids, &mut edges);

        // Iterative DFS with a three-color marking.
        let mut state: HashMap<&AppId, u8> = HashMap::new();
        for start in edges.keys().copied().collect::<Vec<_>>() {
            if state.get(start).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            while let Some((node, next)) = stack.pop() {
                if next == 0 {
                    // A node may be pushed by several parents; visit once.
                    if state.get(node).copied().unwrap_or(0) != 0 {
                        continue;
                    }
                    state.insert(node, 1);
                }
                let targets = edges.get(node).cloned().unwrap_or_default();
                if next < targets.len() {
                    stack.push((node, next + 1));
                    let target = targets[next];
                    match state.get(target).copied().unwrap_or(0) {
                        0 => stack.push((target, 0)),
                        1 => {
                            return Err(ValidationError::DependencyCycle(
                                self.id.to_string(),
                                target.to_string(),
                            ))
                        }
                        _ => {}
                    }
                } else {
                    state.insert(node, 2);
                }
            }
        }
        Ok(())
    }

    fn collect_group_dependency_edges<'a>(
        &'a self,
        ids: &BTreeSet<&'a AppId>,
        edges: &mut HashMap<&'a AppId, Vec<&'a AppId>>,
    ) {
        for dep in &self.dependencies {
            let members: Vec<&AppId> = ids
                .iter()
                .copied()
                .filter(|id| id.is_descendant_of(&self.id))
                .collect();
            let targets: Vec<&AppId> = ids
                .iter()
                .copied()
                .filter(|id| id.is_descendant_of(dep))
                .collect();
            for member in members {
                edges.entry(member).or_default().extend(targets.iter().copied());
            }
        }
        for group in self.groups.values() {
            group.collect_group_dependency_edges(ids, edges);
        }
    }
}

/// The direct child of `parent` on the path towards `descendant`.
fn child_towards(parent: &AppId, descendant: &AppId) -> AppId {
    let parent_str = parent.to_string();
    let desc_str = descendant.to_string();
    let rest = if parent.is_root() {
        &desc_str[1..]
    } else {
        &desc_str[parent_str.len() + 1..]
    };
    let first = rest.split('/').next().unwrap_or_default();
    parent.join(first).unwrap_or_else(|_| parent.clone())
}
