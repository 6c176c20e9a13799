use crate::model::RunId;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Stable `run -> colour` assignment for the compare view.
///
/// A released run keeps its colour reserved so re-adding it restores the
/// same colour. Reservations are reclaimed oldest first, only once every
/// free colour has been handed out.
#[derive(Debug, Clone)]
pub struct CompareRegistry {
    palette_size: usize,
    active: HashMap<RunId, usize>,
    released: VecDeque<(RunId, usize)>,
    wraps: usize,
}

impl CompareRegistry {
    pub fn new(palette_size: usize) -> Self {
        Self {
            palette_size: palette_size.max(1),
            active: HashMap::new(),
            released: VecDeque::new(),
            wraps: 0,
        }
    }

    pub fn palette_size(&self) -> usize {
        self.palette_size
    }

    pub fn color_of(&self, run_id: &RunId) -> Option<usize> {
        self.active.get(run_id).copied()
    }

    pub fn reserved_color(&self, run_id: &RunId) -> Option<usize> {
        self.released
            .iter()
            .find(|(r, _)| r == run_id)
            .map(|(_, c)| *c)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Colour for `run_id`, reusing its active or reserved colour if it has one.
    pub fn activate(&mut self, run_id: &RunId) -> usize {
        if let Some(color) = self.active.get(run_id) {
            return *color;
        }
        if let Some(pos) = self.released.iter().position(|(r, _)| r == run_id) {
            if let Some((_, color)) = self.released.remove(pos) {
                self.active.insert(run_id.clone(), color);
                return color;
            }
        }

        let taken: BTreeSet<usize> = self
            .active
            .values()
            .chain(self.released.iter().map(|(_, c)| c))
            .copied()
            .collect();
        let color = match (0..self.palette_size).find(|c| !taken.contains(c)) {
            Some(free) => free,
            None => self.reclaim_or_wrap(),
        };
        self.active.insert(run_id.clone(), color);
        color
    }

    fn reclaim_or_wrap(&mut self) -> usize {
        if let Some((previous, color)) = self.released.pop_front() {
            tracing::debug!(run_id = %previous, color, "reclaimed reserved compare colour");
            return color;
        }
        let color = self.wraps % self.palette_size;
        self.wraps += 1;
        tracing::warn!(
            palette_size = self.palette_size,
            active = self.active.len(),
            color,
            "compare colour palette exhausted, reusing colour"
        );
        color
    }

    /// Moves the run's colour into the reserved queue.
    pub fn release(&mut self, run_id: &RunId) {
        if let Some(color) = self.active.remove(run_id) {
            self.released.push_back((run_id.clone(), color));
        }
    }
}
