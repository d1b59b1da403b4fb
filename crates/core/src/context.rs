//! Execution context stack.
//!
//! Tracks which batch new jobs join and which callback (if any) is running.
//! Frames are pushed through guards; dropping a guard restores the frame that
//! was current when it was created, on every exit path including unwinding.

use std::ops::{Deref, DerefMut};

use crate::id::BatchId;

/// One level of the context stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    /// Batch that jobs enqueued in this frame join.
    pub batch_id: Option<BatchId>,
    /// Batch whose callback is running in this frame.
    pub callback_id: Option<BatchId>,
}

impl Frame {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn batch(batch_id: BatchId) -> Self {
        Self {
            batch_id: Some(batch_id),
            callback_id: None,
        }
    }

    /// Frame under which a batch's callbacks are dispatched and performed.
    ///
    /// Jobs enqueued here join no batch but are attributed to `callback_id`.
    pub fn callback(callback_id: BatchId) -> Self {
        Self {
            batch_id: None,
            callback_id: Some(callback_id),
        }
    }
}

/// Stack of frames owned by one logical unit of work.
#[derive(Debug, Clone)]
pub struct BatchContext {
    frames: Vec<Frame>,
}

impl Default for BatchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchContext {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::root()],
        }
    }

    /// Context whose base frame is `frame` instead of the empty root.
    pub fn with_base(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    pub fn current(&self) -> Frame {
        self.frames.last().copied().unwrap_or_default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Push `frame` until the returned guard drops.
    pub fn enter(&mut self, frame: Frame) -> ContextGuard<'_> {
        let restore_to = self.frames.len();
        self.frames.push(frame);
        ContextGuard {
            context: self,
            restore_to,
        }
    }

    pub fn enter_batch(&mut self, batch_id: BatchId) -> ContextGuard<'_> {
        self.enter(Frame::batch(batch_id))
    }

    pub fn enter_callback(&mut self, callback_id: BatchId) -> ContextGuard<'_> {
        self.enter(Frame::callback(callback_id))
    }
}

/// Scoped frame. Derefs to the context so nested frames can be entered.
#[derive(Debug)]
pub struct ContextGuard<'a> {
    context: &'a mut BatchContext,
    restore_to: usize,
}

impl Deref for ContextGuard<'_> {
    type Target = BatchContext;

    fn deref(&self) -> &Self::Target {
        self.context
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.context.frames.truncate(self.restore_to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn nested_frames_restore_in_order() {
        let outer = BatchId::new();
        let inner = BatchId::new();
        let mut ctx = BatchContext::new();

        {
            let mut g1 = ctx.enter_batch(outer);
            assert_eq!(g1.current().batch_id, Some(outer));
            {
                let g2 = g1.enter_callback(inner);
                assert_eq!(g2.current(), Frame::callback(inner));
                assert_eq!(g2.depth(), 3);
            }
            assert_eq!(g1.current().batch_id, Some(outer));
        }

        assert_eq!(ctx.current(), Frame::root());
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn frame_is_restored_when_body_panics() {
        let id = BatchId::new();
        let mut ctx = BatchContext::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = ctx.enter_callback(id);
            panic!("callback blew up");
        }));

        assert!(result.is_err());
        assert_eq!(ctx.current(), Frame::root());
    }

    #[test]
    fn base_frame_survives_nested_exit() {
        let callback = BatchId::new();
        let mut ctx = BatchContext::with_base(Frame::callback(callback));
        {
            let _g = ctx.enter_batch(BatchId::new());
        }
        assert_eq!(ctx.current().callback_id, Some(callback));
    }
}
