//! Append-only keyframe database shared between the loop-closure worker and
//! any diagnostic readers.
//!
//! Entries are never mutated or removed after insertion, so a frame id read
//! once stays valid for the rest of the run and concurrent readers need no
//! coordination beyond the lock.

use parking_lot::RwLock;

use crate::frontend::frame::FrameId;
use crate::loop_closure::definitions::LcdFrame;

#[derive(Debug, Default)]
pub struct LcdFrameDatabase {
    frames: RwLock<Vec<LcdFrame>>,
}

impl LcdFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a frame, assigning the next sequential id. Returns that id.
    pub fn append(&self, mut frame: LcdFrame) -> FrameId {
        let mut frames = self.frames.write();
        let id = frames.len() as FrameId;
        frame.id = id;
        frames.push(frame);
        id
    }

    pub fn get(&self, id: FrameId) -> Option<LcdFrame> {
        self.frames.read().get(id as usize).cloned()
    }

    /// Id of the most recently inserted frame.
    pub fn latest(&self) -> Option<FrameId> {
        let frames = self.frames.read();
        frames.last().map(|f| f.id)
    }

    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
