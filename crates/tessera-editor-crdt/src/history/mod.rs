//! Undo history: grouping, stack bounds and navigation state.
//!
//! The manager does not touch documents itself. Each entry lists the roots
//! whose undo primitive received a step while the entry was open; the engine
//! replays those steps in reverse for `back` and in order for `forward`.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use loro::ContainerID;
use loro::cursor::Cursor;
use web_time::{Duration, Instant};

use crate::root::RootId;

/// Primitive steps one entry may hold per root. Each root's undo primitive
/// keeps `stack_size` times this many steps, so every live entry stays whole.
pub(crate) const STEPS_PER_ENTRY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryState {
    Idle,
    /// An entry is open and further edits before the deadline extend it.
    Grouping,
    Undoing,
    Redoing,
}

/// A position stored relative to shared content, so it survives edits.
#[derive(Clone, Debug)]
pub(crate) struct PositionAnchor {
    pub root: RootId,
    pub container: ContainerID,
    pub cursor: Option<Cursor>,
    /// Offset at capture time, used when the cursor cannot be resolved.
    pub offset: usize,
}

#[derive(Clone, Debug)]
pub(crate) struct SelectionAnchor {
    pub anchor: PositionAnchor,
    pub head: PositionAnchor,
}

#[derive(Clone, Debug)]
pub(crate) struct HistoryEntry {
    /// Roots with one primitive step each, in the order they were made.
    pub steps: Vec<RootId>,
    pub before: Option<SelectionAnchor>,
    pub after: Option<SelectionAnchor>,
}

impl HistoryEntry {
    fn fits(&self, steps: &[RootId], budget: usize) -> bool {
        steps.iter().all(|root| {
            let held = self.steps.iter().filter(|r| *r == root).count();
            let added = steps.iter().filter(|r| *r == root).count();
            held + added <= budget
        })
    }
}

#[derive(Debug)]
pub struct HistoryManager {
    state: HistoryState,
    stack: Vec<HistoryEntry>,
    index: usize,
    deadline: Option<Instant>,
    window: Duration,
    stack_size: usize,
    step_budget: usize,
}

impl HistoryManager {
    pub fn new(stack_size: usize, window: Duration) -> Self {
        Self {
            state: HistoryState::Idle,
            stack: Vec::new(),
            index: 0,
            deadline: None,
            window,
            stack_size: stack_size.max(1),
            step_budget: STEPS_PER_ENTRY,
        }
    }

    /// Override the per-root step budget of one entry.
    pub fn with_step_budget(mut self, steps: usize) -> Self {
        self.step_budget = steps.max(1);
        self
    }

    pub fn state(&self) -> HistoryState {
        self.state
    }

    pub fn can_back(&self) -> bool {
        self.index > 0
    }

    pub fn can_forward(&self) -> bool {
        self.index < self.stack.len()
    }

    /// Number of entries on the stack, including redoable ones.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Close an open group if its window has passed.
    pub fn poll(&mut self, now: Instant) {
        if self.state == HistoryState::Grouping && self.deadline.is_some_and(|d| now >= d) {
            self.close_group();
        }
    }

    pub fn close_group(&mut self) {
        if self.state == HistoryState::Grouping {
            self.state = HistoryState::Idle;
        }
        self.deadline = None;
    }

    pub fn clear(&mut self) {
        self.stack.clear();
        self.index = 0;
        self.state = HistoryState::Idle;
        self.deadline = None;
    }

    /// Record primitive steps from a local commit.
    ///
    /// Returns true if a new entry was opened, false if the open entry was
    /// extended. An open entry that would exceed its step budget on any root
    /// is closed and a new one opened.
    pub(crate) fn record(
        &mut self,
        now: Instant,
        steps: &[RootId],
        before: Option<SelectionAnchor>,
        after: Option<SelectionAnchor>,
    ) -> bool {
        self.poll(now);
        if self.state == HistoryState::Grouping {
            let budget = self.step_budget;
            if let Some(entry) = self.stack.last_mut() {
                if entry.fits(steps, budget) {
                    entry.steps.extend_from_slice(steps);
                    entry.after = after;
                    self.deadline = Some(now + self.window);
                    return false;
                }
                tracing::trace!(budget, "history entry full, opening another");
            }
        }

        // a new edit invalidates anything redoable
        self.stack.truncate(self.index);
        self.stack.push(HistoryEntry {
            steps: steps.to_vec(),
            before,
            after,
        });
        if self.stack.len() > self.stack_size {
            let evicted = self.stack.len() - self.stack_size;
            self.stack.drain(..evicted);
            tracing::trace!(evicted, "history stack full, dropped oldest entries");
        }
        self.index = self.stack.len();
        self.state = HistoryState::Grouping;
        self.deadline = Some(now + self.window);
        true
    }

    pub(crate) fn begin_back(&mut self) -> Option<HistoryEntry> {
        self.close_group();
        if self.index == 0 {
            return None;
        }
        self.state = HistoryState::Undoing;
        self.stack.get(self.index - 1).cloned()
    }

    pub(crate) fn end_back(&mut self) {
        self.index = self.index.saturating_sub(1);
        self.state = HistoryState::Idle;
    }

    pub(crate) fn begin_forward(&mut self) -> Option<HistoryEntry> {
        self.close_group();
        let entry = self.stack.get(self.index).cloned()?;
        self.state = HistoryState::Redoing;
        Some(entry)
    }

    pub(crate) fn end_forward(&mut self) {
        self.index = (self.index + 1).min(self.stack.len());
        self.state = HistoryState::Idle;
    }

    /// Abort an undo/redo that failed midway, leaving the index untouched.
    pub(crate) fn abort(&mut self) {
        self.state = HistoryState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(500);

    fn manager(size: usize) -> (HistoryManager, ManualClock) {
        (HistoryManager::new(size, WINDOW), ManualClock::new())
    }

    #[test]
    fn test_edits_within_window_coalesce() {
        let (mut history, clock) = manager(10);
        assert!(history.record(clock.now(), &[RootId::MAIN], None, None));
        clock.advance(Duration::from_millis(100));
        assert!(!history.record(clock.now(), &[RootId::MAIN], None, None));
        assert_eq!(history.len(), 1);
        assert_eq!(history.state(), HistoryState::Grouping);
    }

    #[test]
    fn test_window_slides_with_each_edit() {
        let (mut history, clock) = manager(10);
        history.record(clock.now(), &[RootId::MAIN], None, None);
        for _ in 0..5 {
            clock.advance(Duration::from_millis(400));
            history.record(clock.now(), &[RootId::MAIN], None, None);
        }
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_full_entry_opens_another() {
        let (history, clock) = manager(10);
        let mut history = history.with_step_budget(3);
        for _ in 0..3 {
            history.record(clock.now(), &[RootId::MAIN], None, None);
        }
        assert_eq!(history.len(), 1);
        assert!(history.record(clock.now(), &[RootId::MAIN], None, None));
        assert_eq!(history.len(), 2);
        assert_eq!(history.stack[0].steps.len(), 3);
    }

    #[test]
    fn test_step_budget_counts_each_root() {
        let (history, clock) = manager(10);
        let mut history = history.with_step_budget(2);
        let sub = RootId(1);
        history.record(clock.now(), &[RootId::MAIN], None, None);
        history.record(clock.now(), &[sub], None, None);
        history.record(clock.now(), &[RootId::MAIN, sub], None, None);
        assert_eq!(history.len(), 1);
        assert!(history.record(clock.now(), &[sub], None, None));
    }

    #[test]
    fn test_deadline_closes_group() {
        let (mut history, clock) = manager(10);
        history.record(clock.now(), &[RootId::MAIN], None, None);
        clock.advance(WINDOW);
        history.poll(clock.now());
        assert_eq!(history.state(), HistoryState::Idle);
        assert!(history.record(clock.now(), &[RootId::MAIN], None, None));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_stack_evicts_oldest() {
        let (mut history, clock) = manager(3);
        for _ in 0..5 {
            history.record(clock.now(), &[RootId::MAIN], None, None);
            clock.advance(WINDOW);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.index(), 3);
        let mut undone = 0;
        while history.begin_back().is_some() {
            history.end_back();
            undone += 1;
        }
        assert_eq!(undone, 3);
        assert!(!history.can_back());
    }

    #[test]
    fn test_back_then_edit_truncates_redo() {
        let (mut history, clock) = manager(10);
        for _ in 0..3 {
            history.record(clock.now(), &[RootId::MAIN], None, None);
            clock.advance(WINDOW);
        }
        history.begin_back();
        history.end_back();
        assert!(history.can_forward());

        history.record(clock.now(), &[RootId::MAIN], None, None);
        assert!(!history.can_forward());
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_back_forward_states() {
        let (mut history, clock) = manager(10);
        assert!(history.begin_back().is_none());

        history.record(clock.now(), &[RootId::MAIN], None, None);
        let entry = history.begin_back().unwrap();
        assert_eq!(entry.steps, vec![RootId::MAIN]);
        assert_eq!(history.state(), HistoryState::Undoing);
        history.end_back();
        assert_eq!(history.state(), HistoryState::Idle);

        assert!(history.begin_forward().is_some());
        assert_eq!(history.state(), HistoryState::Redoing);
        history.end_forward();
        assert_eq!(history.index(), 1);
        assert!(history.begin_forward().is_none());
    }

    #[test]
    fn test_back_closes_open_group() {
        let (mut history, clock) = manager(10);
        history.record(clock.now(), &[RootId::MAIN], None, None);
        history.begin_back();
        history.end_back();
        history.begin_forward();
        history.end_forward();
        // a new edit right after must not merge into the redone entry
        assert!(history.record(clock.now(), &[RootId::MAIN], None, None));
    }
}
