//! The single-writer event loop that drives rebuilds.

use crate::translator::CacheHandler;
use pylon_k8s_index::{Builder, Op};
use pylon_k8s_status::StatusUpdate;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tracing::{debug, info};

/// Applies watch operations to the object store and coalesces bursts into
/// timed rebuild cycles.
///
/// Every accepted event arms (or re-arms) a holdoff timer; the rebuild
/// happens when the timer fires, or immediately when more than the
/// maximum holdoff has passed since the previous rebuild. The store, the
/// builder, and the translation all run on this one task, so none of them
/// need locks.
pub struct EventHandler {
    builder: Builder,
    caches: CacheHandler,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,

    holdoff_delay: Duration,
    holdoff_max_delay: Duration,

    /// Observer channel: receives a sequence number after every processed
    /// event, whether or not it produced a rebuild. Sends never block and
    /// drop when the observer is not keeping up; this exists for tests
    /// and metrics, not correctness.
    sequence_tx: Option<mpsc::Sender<u64>>,
    seq: u64,
}

// === impl EventHandler ===

impl EventHandler {
    pub fn new(
        builder: Builder,
        caches: CacheHandler,
        status_tx: mpsc::UnboundedSender<StatusUpdate>,
        holdoff_delay: Duration,
        holdoff_max_delay: Duration,
        sequence_tx: Option<mpsc::Sender<u64>>,
    ) -> Self {
        Self {
            builder,
            caches,
            status_tx,
            holdoff_delay,
            holdoff_max_delay,
            sequence_tx,
            seq: 0,
        }
    }

    pub async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>, drain: drain::Watch) {
        info!("started");

        let mut last = Instant::now();
        let mut outstanding: usize = 0;

        // A single timer is re-armed for each accepted event; `armed`
        // gates whether its expiry means anything.
        let mut armed = false;
        let timer = time::sleep(Duration::ZERO);

        tokio::pin! {
            let shutdown = drain.signaled();
            let timer = timer;
        }

        loop {
            tokio::select! {
                op = ops.recv() => {
                    let Some(op) = op else {
                        info!("op channel closed; stopping");
                        return;
                    };
                    if !self.on_update(op) {
                        // The event could not change the graph; tell
                        // observers we saw it and move on.
                        self.inc_sequence();
                        continue;
                    }

                    outstanding += 1;
                    if last.elapsed() > self.holdoff_max_delay {
                        info!(outstanding, "forcing update");
                        self.rebuild();
                        last = Instant::now();
                        outstanding = 0;
                        armed = false;
                    } else {
                        // Re-arm: the rebuild slides out while events
                        // keep arriving, up to the ceiling above.
                        timer.as_mut().reset(Instant::now() + self.holdoff_delay);
                        armed = true;
                    }
                }

                () = &mut timer, if armed => {
                    debug!(outstanding, "performing delayed update");
                    self.rebuild();
                    last = Instant::now();
                    outstanding = 0;
                    armed = false;
                }

                _ = &mut shutdown => {
                    info!("stopped");
                    return;
                }
            }
        }
    }

    /// Applies one op to the object store, reporting whether it may have
    /// changed the routing graph.
    fn on_update(&mut self, op: Op) -> bool {
        match op {
            Op::Add(obj) => self.builder.source.insert(obj),
            Op::Update { old, new } => {
                if old.same_ignoring_status(&new) {
                    debug!(kind = new.kind(), obj = %new.meta(), "skipping update, only status has changed");
                    return false;
                }
                let removed = self.builder.source.remove(&old);
                let inserted = self.builder.source.insert(new);
                removed || inserted
            }
            Op::Delete(obj) => self.builder.source.remove(&obj),
        }
    }

    /// Builds a fresh graph, refreshes the caches, and hands statuses to
    /// the writer.
    fn rebuild(&mut self) {
        let dag = self.builder.build();
        self.caches.on_change(&dag);

        for (root, status) in dag.statuses {
            let update = StatusUpdate {
                kind: root.kind,
                meta: root.meta,
                status,
            };
            if self.status_tx.send(update).is_err() {
                debug!("status writer is gone; dropping status update");
            }
        }

        self.inc_sequence();
    }

    fn inc_sequence(&mut self) {
        self.seq += 1;
        if let Some(tx) = &self.sequence_tx {
            // Non-blocking by design; a slow observer misses sequence
            // numbers, never holds up the pipeline.
            let _ = tx.try_send(self.seq);
        }
    }
}
