use common::{ServiceSpec, Target};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Resolves target and group names. Inventory management lives elsewhere.
pub trait Inventory: Send + Sync {
    fn target(&self, name: &str) -> Option<Target>;
    fn group(&self, name: &str) -> Option<Vec<String>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticInventory {
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
}

impl StaticInventory {
    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_group(mut self, name: &str, members: &[&str]) -> Self {
        self.groups
            .insert(name.to_string(), members.iter().map(|s| s.to_string()).collect());
        self
    }
}

impl Inventory for StaticInventory {
    fn target(&self, name: &str) -> Option<Target> {
        self.targets.iter().find(|t| t.name == name).cloned()
    }

    fn group(&self, name: &str) -> Option<Vec<String>> {
        self.groups.get(name).cloned()
    }
}

/// Resolve names to targets, de-duplicated by name and in first-seen order.
/// Names unknown to the inventory become bare targets.
pub fn resolve<'a>(inventory: &dyn Inventory, names: impl IntoIterator<Item = &'a String>) -> Vec<Target> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            continue;
        }
        targets.push(inventory.target(name).unwrap_or_else(|| Target::named(name)));
    }
    targets
}

/// Union of a service's direct targets and the members of its groups.
pub fn service_targets(inventory: &dyn Inventory, spec: &ServiceSpec) -> Vec<Target> {
    let mut names = spec.targets.clone();
    for group in &spec.target_groups {
        match inventory.group(group) {
            Some(members) => names.extend(members),
            None => log::warn!("Unknown target group {}", group),
        }
    }
    resolve(inventory, names.iter())
}
