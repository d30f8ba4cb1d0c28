//! Generic dependency tracking between two typed domains.
//!
//! Tracks "item `T` must not fire/be released until dependency `D` occurs"
//! edges, with either-or pairs and alias groups, and yields a queue of items
//! whose dependency set has become empty. The engine instantiates this twice:
//! once for operation readiness (item = execution step, dependency = variable
//! instance binding) and once for buffer release readiness (item = bound
//! array, dependency = consuming-op or whole-frame event).

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

/// Dependency tracker over items `T` and dependencies `D`.
#[derive(Debug)]
pub struct DependencyTracker<T, D> {
    dependencies: HashMap<T, HashSet<D>>,
    or_dependencies: HashMap<T, HashSet<(D, D)>>,
    reverse: HashMap<D, HashSet<T>>,
    reverse_or: HashMap<D, HashSet<T>>,
    satisfied: HashSet<D>,
    // Queue membership guard: an item enters the zero-dependency queue once.
    queued: HashSet<T>,
    queue: VecDeque<T>,
    alias_root: HashMap<T, T>,
    alias_groups: HashMap<T, Vec<T>>,
}

impl<T, D> Default for DependencyTracker<T, D>
where
    T: Eq + Hash + Clone,
    D: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, D> DependencyTracker<T, D>
where
    T: Eq + Hash + Clone,
    D: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            dependencies: HashMap::new(),
            or_dependencies: HashMap::new(),
            reverse: HashMap::new(),
            reverse_or: HashMap::new(),
            satisfied: HashSet::new(),
            queued: HashSet::new(),
            queue: VecDeque::new(),
            alias_groups: HashMap::new(),
            alias_root: HashMap::new(),
        }
    }

    /// Reset all state for reuse between unrelated executions.
    pub fn clear(&mut self) {
        self.dependencies.clear();
        self.or_dependencies.clear();
        self.reverse.clear();
        self.reverse_or.clear();
        self.satisfied.clear();
        self.queued.clear();
        self.queue.clear();
        self.alias_groups.clear();
        self.alias_root.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty() && self.or_dependencies.is_empty() && self.queue.is_empty()
    }

    /// Resolve an item to the root of its alias group (itself if unaliased).
    pub fn alias_root(&self, item: &T) -> T {
        self.alias_root.get(item).cloned().unwrap_or_else(|| item.clone())
    }

    /// True if the item was registered as an alias of another item.
    pub fn is_alias(&self, item: &T) -> bool {
        self.alias_root.contains_key(item)
    }

    /// All members of an item's alias group, root included.
    pub fn alias_group(&self, item: &T) -> Vec<T> {
        let root = self.alias_root(item);
        let mut group = vec![root.clone()];
        if let Some(aliases) = self.alias_groups.get(&root) {
            group.extend(aliases.iter().cloned());
        }
        group
    }

    /// Register `alias` as sharing the release decision of `source`.
    ///
    /// Dependencies later added against the alias are funneled to the group
    /// root, so an aliased item cannot drain while any alias is required.
    pub fn add_alias(&mut self, source: &T, alias: T) {
        let root = self.alias_root(source);
        self.alias_root.insert(alias.clone(), root.clone());
        self.alias_groups.entry(root).or_default().push(alias);
    }

    /// Record that `item` requires `dep` before it can drain.
    pub fn add_dependency(&mut self, item: &T, dep: D) {
        if self.satisfied.contains(&dep) {
            return;
        }
        let root = self.alias_root(item);
        self.reverse
            .entry(dep.clone())
            .or_default()
            .insert(root.clone());
        self.dependencies.entry(root).or_default().insert(dep);
    }

    /// Record that `item` requires either `a` or `b` before it can drain.
    pub fn add_or_dependency(&mut self, item: &T, a: D, b: D) {
        if self.satisfied.contains(&a) || self.satisfied.contains(&b) {
            return;
        }
        let root = self.alias_root(item);
        self.reverse_or
            .entry(a.clone())
            .or_default()
            .insert(root.clone());
        self.reverse_or
            .entry(b.clone())
            .or_default()
            .insert(root.clone());
        self.or_dependencies.entry(root).or_default().insert((a, b));
    }

    /// Remove a single `item -> dep` edge, queueing the item if it drained.
    pub fn remove_dependency(&mut self, item: &T, dep: &D) {
        let root = self.alias_root(item);
        if let Some(set) = self.dependencies.get_mut(&root) {
            set.remove(dep);
        }
        if let Some(items) = self.reverse.get_mut(dep) {
            items.remove(&root);
        }
        if let Some(pairs) = self.or_dependencies.get_mut(&root) {
            let hit: Vec<(D, D)> = pairs
                .iter()
                .filter(|(a, b)| a == dep || b == dep)
                .cloned()
                .collect();
            for pair in hit {
                pairs.remove(&pair);
                for half in [&pair.0, &pair.1] {
                    if let Some(items) = self.reverse_or.get_mut(half) {
                        items.remove(&root);
                    }
                }
            }
        }
        self.check_and_queue(&root);
    }

    /// Mark a dependency as satisfied, removing it from every dependent item.
    pub fn mark_satisfied(&mut self, dep: &D) {
        self.satisfied.insert(dep.clone());
        let direct: Vec<T> = self
            .reverse
            .remove(dep)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for item in &direct {
            if let Some(set) = self.dependencies.get_mut(item) {
                set.remove(dep);
            }
        }
        let either: Vec<T> = self
            .reverse_or
            .remove(dep)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for item in &either {
            if let Some(pairs) = self.or_dependencies.get_mut(item) {
                let hit: Vec<(D, D)> = pairs
                    .iter()
                    .filter(|(a, b)| a == dep || b == dep)
                    .cloned()
                    .collect();
                for pair in hit {
                    pairs.remove(&pair);
                    for half in [&pair.0, &pair.1] {
                        if half != dep {
                            if let Some(items) = self.reverse_or.get_mut(half) {
                                items.remove(item);
                            }
                        }
                    }
                }
            }
        }
        for item in direct.into_iter().chain(either) {
            self.check_and_queue(&item);
        }
    }

    pub fn is_satisfied(&self, dep: &D) -> bool {
        self.satisfied.contains(dep)
    }

    /// True if any `dep -> item` edges remain for the item's alias group.
    pub fn has_dependency(&self, item: &T) -> bool {
        let root = self.alias_root(item);
        let direct = self.dependencies.get(&root).map_or(false, |s| !s.is_empty());
        let either = self
            .or_dependencies
            .get(&root)
            .map_or(false, |s| !s.is_empty());
        direct || either
    }

    /// Queue the item if its dependency set is empty. Called by the session
    /// after it has registered all dependencies of a new item.
    pub fn check_and_queue(&mut self, item: &T) {
        let root = self.alias_root(item);
        if self.has_dependency(&root) {
            return;
        }
        self.dependencies.remove(&root);
        self.or_dependencies.remove(&root);
        if self.queued.insert(root.clone()) {
            self.queue.push_back(root);
        }
    }

    pub fn has_new_all_satisfied(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Pop the next item whose dependencies have all been satisfied.
    pub fn new_all_satisfied(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    /// Drain all currently satisfied items.
    pub fn new_all_satisfied_list(&mut self) -> Vec<T> {
        self.queue.drain(..).collect()
    }

    /// Forget an item entirely (used once a released array is evicted).
    pub fn remove_item(&mut self, item: &T) {
        let root = self.alias_root(item);
        if let Some(deps) = self.dependencies.remove(&root) {
            for dep in deps {
                if let Some(items) = self.reverse.get_mut(&dep) {
                    items.remove(&root);
                }
            }
        }
        if let Some(pairs) = self.or_dependencies.remove(&root) {
            for (a, b) in pairs {
                for half in [&a, &b] {
                    if let Some(items) = self.reverse_or.get_mut(half) {
                        items.remove(&root);
                    }
                }
            }
        }
        if let Some(aliases) = self.alias_groups.remove(&root) {
            for alias in aliases {
                self.alias_root.remove(&alias);
            }
        }
    }
}
