//! Host-side frame pump
//!
//! Pulls frames from a video source and forwards them to the processing
//! worker with single-flight backpressure: at most one frame is in the worker
//! at a time, and frames arriving while one is in flight are dropped
//! immediately (releasing their handles) rather than queued. Processing rate
//! adapts to inference speed with no latency buildup.

use crate::types::Frame;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Fallback pump period when the source has no native frame callback
pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_millis(16);

/// An asynchronous stream of video frames.
///
/// Returning `None` ends the pump.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Frame>;
}

/// Frame source backed by a channel, for hosts with a native per-frame
/// callback that pushes decoded frames as they arrive.
pub struct ChannelSource {
    frames: mpsc::Receiver<Frame>,
}

impl ChannelSource {
    #[must_use]
    pub fn new(frames: mpsc::Receiver<Frame>) -> Self {
        Self { frames }
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }
}

/// Fixed-interval source for hosts without a frame callback: polls a capture
/// closure on a timer. The closure may return `None` transiently (no new
/// frame yet); the source skips those ticks rather than ending the pump.
pub struct IntervalSource<G> {
    interval: tokio::time::Interval,
    capture: G,
}

impl<G> IntervalSource<G>
where
    G: FnMut() -> Option<Frame> + Send,
{
    pub fn new(period: Duration, capture: G) -> Self {
        let mut interval = tokio::time::interval(period);
        // A stalled worker must not cause a burst of stale ticks afterwards
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Self { interval, capture }
    }
}

#[async_trait]
impl<G> FrameSource for IntervalSource<G>
where
    G: FnMut() -> Option<Frame> + Send,
{
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            self.interval.tick().await;
            if let Some(frame) = (self.capture)() {
                return Some(frame);
            }
        }
    }
}

/// Counters reported when the pump stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Frames forwarded to the worker
    pub admitted: u64,
    /// Frames dropped because one was already in flight
    pub dropped: u64,
}

/// Run the pump until the source ends, the sink closes, or `cancel` fires.
///
/// `submit` hands one frame to the worker and returns `false` once the worker
/// is gone. `frames_done` is the worker's completed-frame counter; each
/// change clears the in-flight gate so the next frame is admitted.
pub async fn run_pump<S, F>(
    mut source: S,
    mut submit: F,
    mut frames_done: watch::Receiver<u64>,
    cancel: CancellationToken,
) -> PumpStats
where
    S: FrameSource,
    F: FnMut(Frame) -> bool,
{
    let mut stats = PumpStats::default();
    let mut in_flight = false;

    loop {
        tokio::select! {
            // Drain completions before pulling the next frame, so a frame
            // arriving together with a completion is admitted, not dropped
            biased;
            () = cancel.cancelled() => break,
            changed = frames_done.changed(), if in_flight => {
                if changed.is_err() {
                    // Worker dropped its counter; nothing left to submit to
                    break;
                }
                in_flight = false;
            },
            frame = source.next_frame() => {
                let Some(frame) = frame else { break };
                if in_flight {
                    stats.dropped += 1;
                    // frame drops here, releasing its handle right away
                } else if submit(frame) {
                    in_flight = true;
                    stats.admitted += 1;
                } else {
                    break;
                }
            },
        }
    }

    log::debug!(
        "frame pump stopped: {} admitted, {} dropped",
        stats.admitted,
        stats.dropped
    );
    stats
}
