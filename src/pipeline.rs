//! Worker plumbing between the frontend and the loop-closure detector.
//!
//! Keyframes flow through a channel to a dedicated worker thread; queries
//! run strictly sequentially in arrival order, so the temporal-consistency
//! state inside the detector sees keyframes the same way a synchronous
//! caller would.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver};
use tracing::info;

use crate::loop_closure::definitions::{LcdInput, LcdOutput};
use crate::loop_closure::detector::LoopClosureDetector;

/// Spawn the loop-closure worker.
///
/// The worker consumes `input` until every sender is dropped, publishing one
/// `LcdOutput` per keyframe. Dropping the returned receiver stops the worker
/// at the next publish.
pub fn spawn_lcd_worker(
    mut detector: LoopClosureDetector,
    input: Receiver<LcdInput>,
) -> (JoinHandle<()>, Receiver<LcdOutput>) {
    let (output_tx, output_rx) = unbounded();
    let handle = thread::spawn(move || {
        for keyframe in input.iter() {
            let output = detector.spin_once(keyframe);
            if output_tx.send(output).is_err() {
                break;
            }
        }
        info!("loop-closure worker shutting down");
    });
    (handle, output_rx)
}
