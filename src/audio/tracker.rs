use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::{session::Session, transport::Transport};

/// Background sampler that keeps a session's elapsed time current.
///
/// One tracker exists per playback attempt. It writes only while the
/// session's generation still matches the one it was spawned for.
#[derive(Debug)]
pub struct ElapsedTimeTracker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum Sample {
    Continue,
    Stopped,
    Superseded,
    SessionGone,
}

impl ElapsedTimeTracker {
    pub fn spawn(
        session: Weak<Session>,
        transport: Arc<dyn Transport>,
        generation: u64,
        offset: Duration,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("⏱️ Tracker for generation {} cancelled", generation);
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let sample = sample(&session, transport.as_ref(), &token, generation, offset + started.elapsed()).await;
                match sample {
                    Sample::Continue => {}
                    Sample::Stopped => {
                        debug!("⏱️ Playback stopped, tracker for generation {} exiting", generation);
                        release(&session, generation).await;
                        return;
                    }
                    Sample::Superseded => return,
                    Sample::SessionGone => {
                        warn!("⏱️ Session dropped under a running tracker (generation {})", generation);
                        return;
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stops the tracker. Safe to call repeatedly or after it finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ElapsedTimeTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sample(
    session: &Weak<Session>,
    transport: &dyn Transport,
    token: &CancellationToken,
    generation: u64,
    elapsed: Duration,
) -> Sample {
    if !transport.is_playing().await {
        return Sample::Stopped;
    }

    let Some(session) = session.upgrade() else {
        return Sample::SessionGone;
    };

    let mut state = session.lock().await;
    if token.is_cancelled() || state.generation != generation {
        return Sample::Superseded;
    }
    state.elapsed = elapsed;
    Sample::Continue
}

/// Frees the session's tracker slot if it still belongs to `generation`.
async fn release(session: &Weak<Session>, generation: u64) {
    let Some(session) = session.upgrade() else {
        return;
    };
    let mut state = session.lock().await;
    if state.generation == generation {
        // Dropping our own handle only detaches it.
        state.tracker.take();
    }
}
