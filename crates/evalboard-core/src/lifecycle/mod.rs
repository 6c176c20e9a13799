//! Multi-run lifecycle.
//!
//! The compare set is one base run plus an ordered list of comparison
//! runs. [`LifecycleManager::plan`] diffs a new set against the previous
//! one and returns the flag writes, the removed runs and the added runs.
//! It is the only writer of the compare registry. Removed runs get no flag
//! write from the plan: the caller clears their comparison flags with
//! [`RunFlags::without_comparison`] on whatever the cell currently holds.

mod registry;

pub use registry::CompareRegistry;

use crate::model::{RunId, RunState};
use std::collections::HashSet;

pub const BASE_COMPARE_INDEX: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunFlags {
    pub is_base: bool,
    pub is_comparison: bool,
    pub compare_index: Option<u32>,
    pub color_index: Option<usize>,
}

impl RunFlags {
    pub fn of(state: &RunState) -> Self {
        Self {
            is_base: state.is_base,
            is_comparison: state.is_comparison,
            compare_index: state.compare_index,
            color_index: state.color_index,
        }
    }

    /// Flags left on a run dropped from the compare set. `is_base` and the
    /// colour are kept.
    pub fn without_comparison(self) -> Self {
        Self {
            is_comparison: false,
            compare_index: None,
            ..self
        }
    }

    fn base(color: usize) -> Self {
        Self {
            is_base: true,
            is_comparison: false,
            compare_index: Some(BASE_COMPARE_INDEX),
            color_index: Some(color),
        }
    }

    fn comparison(index: u32, color: usize) -> Self {
        Self {
            is_base: false,
            is_comparison: true,
            compare_index: Some(index),
            color_index: Some(color),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompareSet {
    pub base: Option<RunId>,
    pub compare: Vec<RunId>,
}

impl CompareSet {
    pub fn contains(&self, run_id: &RunId) -> bool {
        self.base.as_ref() == Some(run_id) || self.compare.contains(run_id)
    }

    pub fn runs(&self) -> impl Iterator<Item = &RunId> {
        self.base.iter().chain(self.compare.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparePlan {
    pub flags: Vec<(RunId, RunFlags)>,
    pub added: Vec<RunId>,
    pub removed: Vec<RunId>,
}

#[derive(Debug)]
pub struct LifecycleManager {
    registry: CompareRegistry,
    current: CompareSet,
}

impl LifecycleManager {
    pub fn new(palette_size: usize) -> Self {
        Self {
            registry: CompareRegistry::new(palette_size),
            current: CompareSet::default(),
        }
    }

    pub fn current(&self) -> &CompareSet {
        &self.current
    }

    pub fn registry(&self) -> &CompareRegistry {
        &self.registry
    }

    /// Diffs `(base, compare)` against the current set and updates the
    /// registry. Duplicates and the base itself are dropped from `compare`.
    pub fn plan(&mut self, base: &RunId, compare: &[RunId]) -> ComparePlan {
        let mut seen = HashSet::from([base.clone()]);
        let compare: Vec<RunId> = compare
            .iter()
            .filter(|r| seen.insert((*r).clone()))
            .cloned()
            .collect();
        let next = CompareSet {
            base: Some(base.clone()),
            compare,
        };

        let mut plan = ComparePlan::default();

        // release first so a run swapped out and back in keeps its colour
        for run in self.current.runs() {
            if !next.contains(run) {
                self.registry.release(run);
                plan.removed.push(run.clone());
            }
        }

        plan.flags
            .push((base.clone(), RunFlags::base(self.registry.activate(base))));
        for (i, run) in next.compare.iter().enumerate() {
            let color = self.registry.activate(run);
            let index = BASE_COMPARE_INDEX + 1 + i as u32;
            plan.flags.push((run.clone(), RunFlags::comparison(index, color)));
        }

        plan.added = next
            .runs()
            .filter(|r| !self.current.contains(r))
            .cloned()
            .collect();

        self.current = next;
        plan
    }
}
