//! Undo/redo primitive abstraction.
//!
//! The history manager groups steps and restores selections; the primitive
//! underneath is what actually reverts document state.

/// A backend capable of reverting and reapplying its own recorded steps.
///
/// Implementations must actually perform the undo/redo, not just track state.
/// Each shared document root wraps its CRDT undo manager in one of these.
pub trait UndoManager {
    /// Check if undo is available.
    fn can_undo(&self) -> bool;

    /// Check if redo is available.
    fn can_redo(&self) -> bool;

    /// Revert the most recent step. Returns true if a step was reverted.
    fn undo(&mut self) -> bool;

    /// Reapply the most recently reverted step. Returns true if one was.
    fn redo(&mut self) -> bool;

    /// Clear all undo/redo history.
    fn clear_history(&mut self);
}
