//! Request/response correlation over a channel.
//!
//! A [`Correlator`] owns one or more OS threads running a synchronous handler.
//! Callers send `Envelope { id, request }` and await the reply carrying the same
//! id; handlers may emit out-of-band progress for the request they are serving,
//! which is routed to the caller's progress sink before the final reply.

use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc as async_mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::WorkerError;

#[derive(Debug)]
pub struct Envelope<Req> {
    pub id: u64,
    pub request: Req,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadProgress {
    pub bytes_written: u64,
    pub percent: f64,
}

#[derive(Debug)]
pub enum Outbound<Resp> {
    Progress { id: u64, progress: UploadProgress },
    Reply { id: u64, response: Resp },
}

pub type ProgressSink = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Lets a handler report progress for the request it is currently serving.
pub struct ProgressEmitter<'a, Resp> {
    id: u64,
    outbound: &'a async_mpsc::UnboundedSender<Outbound<Resp>>,
}

impl<Resp> ProgressEmitter<'_, Resp> {
    pub fn emit(&self, progress: UploadProgress) {
        let _ = self.outbound.send(Outbound::Progress {
            id: self.id,
            progress,
        });
    }
}

struct Pending<Resp> {
    reply: oneshot::Sender<Resp>,
    progress: Option<ProgressSink>,
}

/// Flips `alive` off when a worker thread exits, including by panic.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Correlator<Req, Resp> {
    name: String,
    requests: mpsc::Sender<Envelope<Req>>,
    pending: Arc<DashMap<u64, Pending<Resp>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl<Req, Resp> Correlator<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Start a single worker thread. Must be called inside a Tokio runtime,
    /// because replies are routed by a Tokio task.
    pub fn spawn<H>(name: &str, mut handler: H) -> io::Result<Self>
    where
        H: FnMut(Req, &ProgressEmitter<'_, Resp>) -> Resp + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel::<Envelope<Req>>();
        let (outbound_tx, outbound_rx) = async_mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        let guard = AliveGuard(Arc::clone(&alive));
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                for envelope in request_rx {
                    let emitter = ProgressEmitter {
                        id: envelope.id,
                        outbound: &outbound_tx,
                    };
                    let response = handler(envelope.request, &emitter);
                    let reply = Outbound::Reply {
                        id: envelope.id,
                        response,
                    };
                    if outbound_tx.send(reply).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self::with_router(name, request_tx, outbound_rx, alive))
    }

    /// Start `size` worker threads sharing one request queue.
    pub fn spawn_pool<H>(name: &str, size: usize, handler: H) -> io::Result<Self>
    where
        H: Fn(Req, &ProgressEmitter<'_, Resp>) -> Resp + Send + Sync + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel::<Envelope<Req>>();
        let (outbound_tx, outbound_rx) = async_mpsc::unbounded_channel();
        let request_rx = Arc::new(Mutex::new(request_rx));
        let handler = Arc::new(handler);
        let alive = Arc::new(AtomicBool::new(true));
        let live_threads = Arc::new(AtomicU64::new(size.max(1) as u64));

        for index in 0..size.max(1) {
            let request_rx = Arc::clone(&request_rx);
            let handler = Arc::clone(&handler);
            let outbound_tx = outbound_tx.clone();
            let alive = Arc::clone(&alive);
            let live_threads = Arc::clone(&live_threads);
            thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    // The pool counts as dead once its last thread is gone.
                    struct PoolGuard(Arc<AtomicU64>, Arc<AtomicBool>);
                    impl Drop for PoolGuard {
                        fn drop(&mut self) {
                            if self.0.fetch_sub(1, Ordering::SeqCst) == 1 {
                                self.1.store(false, Ordering::SeqCst);
                            }
                        }
                    }
                    let _guard = PoolGuard(live_threads, alive);

                    loop {
                        let next = match request_rx.lock() {
                            Ok(receiver) => receiver.recv(),
                            Err(_) => break,
                        };
                        let envelope = match next {
                            Ok(envelope) => envelope,
                            Err(_) => break,
                        };
                        let emitter = ProgressEmitter {
                            id: envelope.id,
                            outbound: &outbound_tx,
                        };
                        let response = handler(envelope.request, &emitter);
                        let reply = Outbound::Reply {
                            id: envelope.id,
                            response,
                        };
                        if outbound_tx.send(reply).is_err() {
                            break;
                        }
                    }
                })?;
        }

        Ok(Self::with_router(name, request_tx, outbound_rx, alive))
    }

    fn with_router(
        name: &str,
        requests: mpsc::Sender<Envelope<Req>>,
        mut outbound: async_mpsc::UnboundedReceiver<Outbound<Resp>>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        let pending: Arc<DashMap<u64, Pending<Resp>>> = Arc::new(DashMap::new());
        let router_pending = Arc::clone(&pending);
        let router_name = name.to_string();

        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                match message {
                    Outbound::Progress { id, progress } => {
                        if let Some(entry) = router_pending.get(&id) {
                            if let Some(sink) = &entry.progress {
                                sink(progress);
                            }
                        }
                    }
                    Outbound::Reply { id, response } => match router_pending.remove(&id) {
                        Some((_, pending)) => {
                            let _ = pending.reply.send(response);
                        }
                        None => debug!("{}: dropping late reply for request {}", router_name, id),
                    },
                }
            }
            if !router_pending.is_empty() {
                error!(
                    "{}: worker exited with {} requests outstanding",
                    router_name,
                    router_pending.len()
                );
            }
            // Dropping the senders fails every outstanding caller.
            router_pending.clear();
        });

        Self {
            name: name.to_string(),
            requests,
            pending,
            next_id: AtomicU64::new(1),
            alive,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and await the reply with the matching id. On timeout the
    /// pending entry is dropped, so a late reply is discarded by the router.
    pub async fn call(
        &self,
        request: Req,
        progress: Option<ProgressSink>,
        timeout: Option<Duration>,
    ) -> Result<Resp, WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            id,
            Pending {
                reply: reply_tx,
                progress,
            },
        );

        if self.requests.send(Envelope { id, request }).is_err() {
            self.pending.remove(&id);
            return Err(WorkerError::unavailable(&self.name));
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.remove(&id);
                    warn!("{}: request {} timed out after {:?}", self.name, id, limit);
                    return Err(WorkerError::timed_out(&self.name, limit));
                }
            },
            None => reply_rx.await,
        };

        outcome.map_err(|_| WorkerError::unavailable(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerErrorKind;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_replies_are_matched_by_id() {
        let worker = Correlator::spawn("echo", |n: u32, _: &ProgressEmitter<'_, u32>| n * 2)
            .unwrap();
        let (a, b) = tokio::join!(worker.call(3, None, None), worker.call(5, None, None));
        assert_eq!(a.unwrap(), 6);
        assert_eq!(b.unwrap(), 10);
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_progress_arrives_before_reply() {
        let worker = Correlator::spawn("progress", |steps: u64, emitter: &ProgressEmitter<'_, u64>| {
            for step in 1..=steps {
                emitter.emit(UploadProgress {
                    bytes_written: step,
                    percent: step as f64 / steps as f64 * 100.0,
                });
            }
            steps
        })
        .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let sink_seen = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |_| {
            sink_seen.fetch_add(1, Ordering::SeqCst);
        });

        let result = worker.call(4, Some(sink), None).await.unwrap();
        assert_eq!(result, 4);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_cleans_pending_entry() {
        let worker = Correlator::spawn("slow", |ms: u64, _: &ProgressEmitter<'_, u64>| {
            thread::sleep(Duration::from_millis(ms));
            ms
        })
        .unwrap();

        let err = worker
            .call(300, None, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::TimedOut);
        assert_eq!(worker.in_flight(), 0);

        // The worker itself keeps serving after a timeout.
        assert_eq!(worker.call(1, None, None).await.unwrap(), 1);
        assert!(worker.is_alive());
    }

    #[tokio::test]
    async fn test_panicking_worker_reports_unavailable() {
        let worker = Correlator::spawn("fragile", |fail: bool, _: &ProgressEmitter<'_, bool>| {
            if fail {
                panic!("worker blew up");
            }
            fail
        })
        .unwrap();

        let err = worker.call(true, None, None).await.unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::Unavailable);
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn test_pool_serves_concurrently() {
        let worker = Correlator::spawn_pool("pool", 3, |ms: u64, _: &ProgressEmitter<'_, u64>| {
            thread::sleep(Duration::from_millis(ms));
            ms
        })
        .unwrap();

        let started = std::time::Instant::now();
        let (a, b, c) = tokio::join!(
            worker.call(100, None, None),
            worker.call(100, None, None),
            worker.call(100, None, None)
        );
        assert_eq!(a.unwrap() + b.unwrap() + c.unwrap(), 300);
        assert!(started.elapsed() < Duration::from_millis(280));
    }
}
