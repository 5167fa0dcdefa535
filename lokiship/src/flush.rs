//! Batch queue and flush scheduler.
//!
//! Producers hand entries to a [`FlushHandle`], which feeds a bounded
//! channel. A single [`FlushScheduler`] task owns the receiving end and
//! flushes its buffer when it holds `batch_size` entries or when the
//! `batch_wait` interval fires with a non-empty buffer, whichever comes
//! first.
//!
//! Control commands travel in the same channel as entries, so an explicit
//! flush or a shutdown sees every entry enqueued before it.

use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::batch::group_streams;
use crate::entry::LabeledEntry;
use crate::error::{ClientError, LokiError, PushError};
use crate::push::Push;

/// Counters kept by the scheduler over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Number of non-empty flushes attempted.
    pub flushes: u64,
    /// Entries delivered to the backend.
    pub entries_sent: u64,
    /// Flushes whose batch could not be delivered.
    pub batches_failed: u64,
    /// Entries lost with those batches.
    pub entries_dropped: u64,
}

#[derive(Debug)]
enum Command {
    Entry(LabeledEntry),
    Flush(oneshot::Sender<Result<(), PushError>>),
    Shutdown(oneshot::Sender<FlushStats>),
}

/// Producer side of the batch queue.
#[derive(Debug, Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<Command>,
}

impl FlushHandle {
    /// Enqueues one entry, waiting for queue capacity if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] once the scheduler has stopped.
    pub async fn enqueue(&self, entry: LabeledEntry) -> Result<(), ClientError> {
        self.tx
            .send(Command::Entry(entry))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Flushes everything enqueued so far and waits for the send result.
    ///
    /// # Errors
    ///
    /// Returns the push failure of the batch, or [`ClientError::Closed`] if
    /// the scheduler has stopped.
    pub async fn flush(&self) -> Result<(), LokiError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply_tx))
            .await
            .map_err(|_| ClientError::Closed)?;

        reply_rx.await.map_err(|_| ClientError::Closed)??;
        Ok(())
    }

    /// Stops the scheduler after draining and flushing all queued entries.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the scheduler had already stopped.
    pub async fn shutdown(&self) -> Result<FlushStats, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply_tx))
            .await
            .map_err(|_| ClientError::Closed)?;

        reply_rx.await.map_err(|_| ClientError::Closed)
    }

    /// Returns `true` once the scheduler no longer accepts entries.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single consumer of the batch queue.
pub struct FlushScheduler<P> {
    rx: mpsc::Receiver<Command>,
    pusher: P,
    buffer: Vec<LabeledEntry>,
    batch_size: usize,
    batch_wait: Duration,
    stats: FlushStats,
}

impl<P: Push> FlushScheduler<P> {
    /// Creates a scheduler and the handle that feeds it.
    ///
    /// `capacity` bounds the number of queued commands; producers wait when
    /// it is reached. It is clamped to what the channel can hold. The scheduler does nothing until [`run`](Self::run) is
    /// spawned.
    pub fn new(
        pusher: P,
        batch_size: usize,
        batch_wait: Duration,
        capacity: usize,
    ) -> (Self, FlushHandle) {
        let (tx, rx) = mpsc::channel(capacity.clamp(1, Semaphore::MAX_PERMITS));
        let scheduler = Self {
            rx,
            pusher,
            buffer: Vec::with_capacity(batch_size),
            batch_size: batch_size.max(1),
            batch_wait,
            stats: FlushStats::default(),
        };
        (scheduler, FlushHandle { tx })
    }

    /// Runs until shutdown is requested or every handle is dropped.
    ///
    /// Returns the final counters.
    pub async fn run(mut self) -> FlushStats {
        info!(
            batch_size = self.batch_size,
            "Flush scheduler started, batch wait {:?}", self.batch_wait
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.batch_wait, self.batch_wait);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle(command).await {
                            let mut replies = vec![reply];
                            replies.extend(self.drain().await);
                            for reply in replies {
                                if reply.send(self.stats).is_err() {
                                    warn!("Shutdown requester went away before receiving stats");
                                }
                            }
                            break;
                        }
                    }
                    None => {
                        debug!("All flush handles dropped");
                        let _ = self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        let _ = self.flush().await;
                    }
                }
            }
        }

        info!(
            flushes = self.stats.flushes,
            entries_sent = self.stats.entries_sent,
            entries_dropped = self.stats.entries_dropped,
            "Flush scheduler stopped"
        );
        self.stats
    }

    /// Applies one command. A shutdown request is handed back to the caller.
    async fn handle(&mut self, command: Command) -> Option<oneshot::Sender<FlushStats>> {
        match command {
            Command::Entry(entry) => {
                self.buffer.push(entry);
                if self.buffer.len() >= self.batch_size {
                    let _ = self.flush().await;
                }
            }
            Command::Flush(reply) => {
                let result = self.flush().await;
                if reply.send(result).is_err() {
                    warn!("Flush requester went away before receiving the result");
                }
            }
            Command::Shutdown(reply) => return Some(reply),
        }
        None
    }

    /// Closes the queue, processes whatever is still in it, then flushes.
    ///
    /// Returns the shutdown requests found in the queue; they are answered
    /// with the final counters.
    async fn drain(&mut self) -> Vec<oneshot::Sender<FlushStats>> {
        self.rx.close();
        let mut pending = Vec::new();
        while let Some(command) = self.rx.recv().await {
            pending.extend(self.handle(command).await);
        }
        let _ = self.flush().await;
        pending
    }

    /// Sends the buffer as one batch. Failed batches are dropped and counted.
    async fn flush(&mut self) -> Result<(), PushError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let entries = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let count = entries.len() as u64;
        let streams = group_streams(entries);
        self.stats.flushes += 1;

        debug!(entries = count, streams = streams.len(), "Flushing batch");

        match self.pusher.push(&streams).await {
            Ok(()) => {
                self.stats.entries_sent += count;
                Ok(())
            }
            Err(err) => {
                self.stats.batches_failed += 1;
                self.stats.entries_dropped += count;
                error!(entries = count, "Dropping batch after failed push: {err}");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::batch::Stream;
    use crate::entry::Entry;

    /// Records every batch it is given instead of sending it.
    #[derive(Clone, Default)]
    struct Recorder {
        batches: Arc<Mutex<Vec<Vec<Stream>>>>,
        fail: bool,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn batches(&self) -> Vec<Vec<Stream>> {
            self.batches.lock().unwrap().clone()
        }

        fn lines(&self) -> Vec<Vec<String>> {
            self.batches()
                .iter()
                .map(|batch| {
                    batch
                        .iter()
                        .flat_map(|s| s.entries.iter().map(|e| e.line.clone()))
                        .collect()
                })
                .collect()
        }
    }

    impl Push for Recorder {
        async fn push(&self, streams: &[Stream]) -> Result<(), PushError> {
            self.batches.lock().unwrap().push(streams.to_vec());
            if self.fail {
                Err(PushError::Rejected {
                    status: 500,
                    body: "boom".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn entry(labels: &str, line: &str) -> LabeledEntry {
        LabeledEntry {
            entry: Entry {
                timestamp: Utc.with_ymd_and_hms(2021, 1, 8, 11, 50, 0).unwrap(),
                line: line.to_string(),
            },
            labels: labels.to_string(),
        }
    }

    fn start(
        recorder: &Recorder,
        batch_size: usize,
        batch_wait: Duration,
    ) -> (FlushHandle, tokio::task::JoinHandle<FlushStats>) {
        let (scheduler, handle) = FlushScheduler::new(recorder.clone(), batch_size, batch_wait, 64);
        (handle, tokio::spawn(scheduler.run()))
    }

    #[tokio::test]
    async fn test_count_trigger_and_final_flush() {
        let recorder = Recorder::default();
        let (handle, task) = start(&recorder, 2, Duration::from_secs(3600));

        for line in ["1", "2", "3"] {
            handle.enqueue(entry("{a=\"1\"}", line)).await.unwrap();
        }
        let stats = handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(recorder.lines(), vec![vec!["1", "2"], vec!["3"]]);
        assert_eq!(
            stats,
            FlushStats {
                flushes: 2,
                entries_sent: 3,
                batches_failed: 0,
                entries_dropped: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_time_trigger() {
        let recorder = Recorder::default();
        let (handle, task) = start(&recorder, 100, Duration::from_millis(50));

        handle.enqueue(entry("{a=\"1\"}", "only")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(recorder.lines(), vec![vec!["only"]]);

        let stats = handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.entries_sent, 1);
    }

    #[tokio::test]
    async fn test_empty_ticks_do_not_flush() {
        let recorder = Recorder::default();
        let (handle, task) = start(&recorder, 10, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(recorder.batches().is_empty());
        assert_eq!(stats.flushes, 0);
    }

    #[tokio::test]
    async fn test_flush_groups_and_preserves_order_across_cycles() {
        let recorder = Recorder::default();
        let (handle, task) = start(&recorder, 100, Duration::from_secs(3600));

        handle.enqueue(entry("{a=\"1\"}", "a1")).await.unwrap();
        handle.enqueue(entry("{b=\"2\"}", "b1")).await.unwrap();
        handle.enqueue(entry("{a=\"1\"}", "a2")).await.unwrap();
        handle.flush().await.unwrap();
        handle.enqueue(entry("{a=\"1\"}", "a3")).await.unwrap();
        handle.flush().await.unwrap();
        // Nothing buffered: no request.
        handle.flush().await.unwrap();

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let batches = recorder.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].labels, "{a=\"1\"}");
        assert_eq!(batches[0][0].entries.len(), 2);
        assert_eq!(batches[0][0].entries[0].line, "a1");
        assert_eq!(batches[0][0].entries[1].line, "a2");
        assert_eq!(batches[0][1].entries[0].line, "b1");
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].entries[0].line, "a3");
    }

    #[tokio::test]
    async fn test_failed_batch_is_reported_and_dropped() {
        let recorder = Recorder::failing();
        let (handle, task) = start(&recorder, 100, Duration::from_secs(3600));

        handle.enqueue(entry("{a=\"1\"}", "x")).await.unwrap();
        handle.enqueue(entry("{a=\"1\"}", "y")).await.unwrap();
        let err = handle.flush().await.unwrap_err();
        assert!(matches!(
            err,
            LokiError::Push(PushError::Rejected { status: 500, .. })
        ));

        // The dropped batch is not resent by shutdown.
        let stats = handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(recorder.batches().len(), 1);
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.entries_dropped, 2);
        assert_eq!(stats.entries_sent, 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let recorder = Recorder::default();
        let (handle, task) = start(&recorder, 10, Duration::from_secs(3600));

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(handle.is_closed());
        assert!(matches!(
            handle.enqueue(entry("{a=\"1\"}", "late")).await,
            Err(ClientError::Closed)
        ));
        assert!(matches!(
            handle.shutdown().await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dropping_handles_flushes_and_stops() {
        let recorder = Recorder::default();
        let (handle, task) = start(&recorder, 10, Duration::from_secs(3600));

        handle.enqueue(entry("{a=\"1\"}", "last")).await.unwrap();
        drop(handle);

        let stats = task.await.unwrap();
        assert_eq!(stats.entries_sent, 1);
        assert_eq!(recorder.lines(), vec![vec!["last"]]);
    }

    /// Holds every push until the gate is opened.
    #[derive(Clone)]
    struct Gated {
        gate: Arc<tokio::sync::Semaphore>,
        recorder: Recorder,
    }

    impl Push for Gated {
        async fn push(&self, streams: &[Stream]) -> Result<(), PushError> {
            let _permit = self.gate.acquire().await.unwrap();
            self.recorder.push(streams).await
        }
    }

    #[tokio::test]
    async fn test_enqueue_waits_while_queue_is_full() {
        let recorder = Recorder::default();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let pusher = Gated {
            gate: Arc::clone(&gate),
            recorder: recorder.clone(),
        };
        let (scheduler, handle) = FlushScheduler::new(pusher, 1, Duration::from_secs(3600), 1);
        let task = tokio::spawn(scheduler.run());

        // "1" is taken by the scheduler and stuck in push, "2" fills the queue.
        handle.enqueue(entry("{a=\"1\"}", "1")).await.unwrap();
        handle.enqueue(entry("{a=\"1\"}", "2")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(100), handle.enqueue(entry("{a=\"1\"}", "3")))
                .await;
        assert!(blocked.is_err(), "enqueue should wait for queue capacity");

        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), handle.enqueue(entry("{a=\"1\"}", "3")))
            .await
            .expect("enqueue should proceed once the queue drains")
            .unwrap();

        let stats = handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(stats.entries_sent, 3);
        assert_eq!(recorder.lines(), vec![vec!["1"], vec!["2"], vec!["3"]]);
    }

    #[tokio::test]
    async fn test_queued_shutdowns_all_get_final_stats() {
        let recorder = Recorder::default();
        let (scheduler, handle) =
            FlushScheduler::new(recorder.clone(), 100, Duration::from_secs(3600), 16);

        handle.enqueue(entry("{a=\"1\"}", "pending")).await.unwrap();
        let first = handle.clone();
        let second = handle.clone();
        let first = tokio::spawn(async move { first.shutdown().await });
        let second = tokio::spawn(async move { second.shutdown().await });

        // Both shutdown requests sit in the queue behind the entry.
        while handle.tx.capacity() > 13 {
            tokio::task::yield_now().await;
        }
        let task = tokio::spawn(scheduler.run());

        let expected = FlushStats {
            flushes: 1,
            entries_sent: 1,
            batches_failed: 0,
            entries_dropped: 0,
        };
        assert_eq!(first.await.unwrap().unwrap(), expected);
        assert_eq!(second.await.unwrap().unwrap(), expected);
        assert_eq!(task.await.unwrap(), expected);
    }
}
