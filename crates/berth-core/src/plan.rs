//! Deployment plans.
//!
//! A plan is an ordered list of steps transforming one group version into
//! another. Steps are dependency-ordered: an app's dependencies are handled
//! in an earlier step than the app itself. Removed apps are stopped in a
//! final step.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::group::Group;
use crate::ids::AppId;
use crate::run_spec::RunSpec;
use crate::version::Timestamp;

/// A single per-app action inside a deployment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Launch a new app and scale it to its target count.
    Start { run_spec: RunSpec, scale_to: u32 },
    /// Change the instance count of an unchanged config.
    Scale { run_spec: RunSpec, scale_to: u32 },
    /// Replace all instances with the new config.
    Restart { run_spec: RunSpec },
    /// Tear the app down entirely.
    Stop { run_spec: RunSpec },
}

impl DeploymentAction {
    pub fn app_id(&self) -> &AppId {
        match self {
            DeploymentAction::Start { run_spec, .. }
            | DeploymentAction::Scale { run_spec, .. }
            | DeploymentAction::Restart { run_spec }
            | DeploymentAction::Stop { run_spec } => &run_spec.id,
        }
    }
}

/// One step of a plan; actions within a step are independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

/// An ordered list of steps transforming `original` into `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    pub original: Group,
    pub target: Group,
    pub steps: Vec<DeploymentStep>,
    pub version: Timestamp,
}

impl DeploymentPlan {
    /// Compute the plan from a group diff. Steps follow the dependency
    /// order of the target; removals come last.
    pub fn compute(original: Group, target: Group, version: Timestamp) -> DeploymentPlan {
        let orig_apps: BTreeMap<AppId, &RunSpec> = original
            .transitive_run_specs()
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        let target_apps: BTreeMap<AppId, &RunSpec> = target
            .transitive_run_specs()
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();

        let layers = dependency_layers(&target_apps);

        let mut steps: Vec<DeploymentStep> = Vec::new();
        for layer in layers {
            let mut step = DeploymentStep::default();
            for id in layer {
                let spec = target_apps[&id];
                match orig_apps.get(&id) {
                    None => {
                        step.actions.push(DeploymentAction::Start {
                            run_spec: spec.clone(),
                            scale_to: spec.instances,
                        });
                    }
                    Some(old) if old.is_upgrade(spec) => {
                        step.actions.push(DeploymentAction::Restart {
                            run_spec: spec.clone(),
                        });
                    }
                    Some(old) if old.instances != spec.instances => {
                        step.actions.push(DeploymentAction::Scale {
                            run_spec: spec.clone(),
                            scale_to: spec.instances,
                        });
                    }
                    Some(_) => {}
                }
            }
            if !step.actions.is_empty() {
                steps.push(step);
            }
        }

        let mut stop_step = DeploymentStep::default();
        for (id, spec) in &orig_apps {
            if !target_apps.contains_key(id) {
                stop_step.actions.push(DeploymentAction::Stop {
                    run_spec: (*spec).clone(),
                });
            }
        }
        if !stop_step.actions.is_empty() {
            steps.push(stop_step);
        }

        DeploymentPlan {
            id: Uuid::new_v4().to_string(),
            original,
            target,
            steps,
            version,
        }
    }

    /// The apps this plan locks: the symmetric difference of the two app
    /// sets plus every config-changed app. Scale-only changes are not
    /// counted.
    pub fn affected_run_spec_ids(&self) -> BTreeSet<AppId> {
        let orig: BTreeMap<AppId, &RunSpec> = self
            .original
            .transitive_run_specs()
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        let target: BTreeMap<AppId, &RunSpec> = self
            .target
            .transitive_run_specs()
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();

        let mut affected = BTreeSet::new();
        for (id, spec) in &orig {
            match target.get(id) {
                None => {
                    affected.insert(id.clone());
                }
                Some(new) if spec.is_upgrade(new) => {
                    affected.insert(id.clone());
                }
                Some(_) => {}
            }
        }
        for id in target.keys() {
            if !orig.contains_key(id) {
                affected.insert(id.clone());
            }
        }
        affected
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Group target apps into dependency layers: layer n contains apps whose
/// longest dependency chain within the target set has length n. Unresolvable
/// edges (dependencies outside the set) are ignored.
fn dependency_layers(apps: &BTreeMap<AppId, &RunSpec>) -> Vec<Vec<AppId>> {
    fn depth(
        id: &AppId,
        apps: &BTreeMap<AppId, &RunSpec>,
        memo: &mut BTreeMap<AppId, usize>,
        visiting: &mut BTreeSet<AppId>,
    ) -> usize {
        if let Some(d) = memo.get(id) {
            return *d;
        }
        if !visiting.insert(id.clone()) {
            // Cycles are rejected by group validation; guard anyway.
            return 0;
        }
        let spec = apps[id];
        let d = spec
            .dependencies
            .iter()
            .flat_map(|dep| {
                apps.keys()
                    .filter(move |other| other.is_descendant_of(dep))
            })
            .filter(|other| *other != id)
            .map(|other| depth(other, apps, memo, visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.remove(id);
        memo.insert(id.clone(), d);
        d
    }

    let mut memo = BTreeMap::new();
    let mut layers: BTreeMap<usize, Vec<AppId>> = BTreeMap::new();
    for id in apps.keys() {
        let d = depth(id, apps, &mut memo, &mut BTreeSet::new());
        layers.entry(d).or_default().push(id.clone());
    }
    layers.into_values().collect()
}
