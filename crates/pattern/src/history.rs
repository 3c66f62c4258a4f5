use std::collections::VecDeque;

/// Bounded undo/redo stacks of whole-state snapshots.
#[derive(Debug, Clone)]
pub struct History<T> {
    undo: VecDeque<T>,
    redo: Vec<T>,
    max_levels: usize,
}

impl<T: Clone> History<T> {
    pub const DEFAULT_MAX_LEVELS: usize = 32;

    pub fn new(max_levels: usize) -> Self {
        Self {
            undo: VecDeque::with_capacity(max_levels),
            redo: Vec::new(),
            max_levels: max_levels.max(1),
        }
    }

    /// Record `previous` as the state before an edit. Clears redo.
    pub fn record(&mut self, previous: T) {
        self.redo.clear();
        self.undo.push_back(previous);
        if self.undo.len() > self.max_levels {
            self.undo.pop_front();
        }
    }

    /// Swap `current` for the last recorded state.
    pub fn undo(&mut self, current: T) -> Option<T> {
        let previous = self.undo.pop_back()?;
        self.redo.push(current);
        Some(previous)
    }

    pub fn redo(&mut self, current: T) -> Option<T> {
        let next = self.redo.pop()?;
        self.undo.push_back(current);
        Some(next)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }
}

impl<T: Clone> Default for History<T> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_LEVELS)
    }
}
