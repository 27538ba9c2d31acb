use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::storage::{LogSink, RequestLogRecord};

const QUEUE_CAPACITY: usize = 1024;
const WORKERS: usize = 2;

/// Decouples request handling from log persistence: records go into a
/// bounded queue consumed by a fixed pool of workers, so a slow sink can
/// never pile up unbounded tasks. When the queue is full the record is
/// dropped and counted.
pub struct LogWriter {
    tx: mpsc::Sender<RequestLogRecord>,
    dropped: AtomicU64,
}

impl LogWriter {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self::with_capacity(sink, QUEUE_CAPACITY, WORKERS)
    }

    pub fn with_capacity(sink: Arc<dyn LogSink>, capacity: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<RequestLogRecord>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                loop {
                    // Lock only around the recv so workers take turns
                    // pulling from the shared queue.
                    let record = rx.lock().await.recv().await;
                    match record {
                        Some(record) => {
                            if let Err(error) = sink.save(&[record]).await {
                                warn!("failed to save request log: {}", error);
                            }
                        }
                        // Channel closed: the writer is gone.
                        None => return,
                    }
                }
            });
        }

        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks the request path.
    pub fn enqueue(&self, record: RequestLogRecord) {
        if self.tx.try_send(record).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("request-log queue full, {} records dropped so far", dropped);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
