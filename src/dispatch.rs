/// Dispatch — produces N semantically-independent copies of a value for
/// fan-out to N targets (a broadcast's remote hops plus local
/// subscribers). Scalars are shared by reference; sequences and maps are
/// recursively cloned; streams and pins get dedicated handlers, since
/// naive cloning would either duplicate side effects (streams) or break
/// identity (pins).
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

/// A value flowing through the dispatch engine. `Scalar` covers
/// null/primitives/opaque byte buffers from the wire codec.
#[derive(Clone)]
pub enum DispatchValue {
    Scalar(Vec<u8>),
    Seq(Vec<DispatchValue>),
    Map(Vec<(String, DispatchValue)>),
    Stream(StreamHandle),
    Pin(PinHandle),
}

/// A lazily-pulled sequence of scalar chunks, owned by the dispatch
/// engine rather than cloned: each proxy reads its own queue, fed from a
/// single upstream reader.
pub struct StreamHandle {
    rx: mpsc::Receiver<StreamEvent>,
}

#[derive(Clone, Debug)]
enum StreamEvent {
    Chunk(Vec<u8>),
    Closed,
    Errored(String),
}

impl StreamHandle {
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>> + Send + 'static,
        I::IntoIter: Send,
    {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for v in values {
                if tx.send(StreamEvent::Chunk(v)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamEvent::Closed).await;
        });
        Self { rx }
    }

    /// Pull the next chunk. Returns `None` once the stream has closed
    /// (cleanly or with an error — callers distinguish via `into_stream`).
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, String>> {
        match self.rx.recv().await {
            Some(StreamEvent::Chunk(c)) => Some(Ok(c)),
            Some(StreamEvent::Closed) | None => None,
            Some(StreamEvent::Errored(reason)) => Some(Err(reason)),
        }
    }
}

/// A proxy object for a remote-managed resource. Never cloned: every
/// dispatch target receives a reference to the same handle.
#[derive(Clone)]
pub struct PinHandle(pub Arc<str>);

/// Custom reference-type handler matched by `can_handle`, first match
/// wins, analogous to the teacher's decision-engine-plus-registry style.
pub trait DispatchHandler: Send + Sync {
    fn can_handle(&self, value: &DispatchValue) -> bool;
    fn dispatch(&self, value: DispatchValue, n: usize) -> Vec<DispatchValue>;
}

pub struct DispatchEngine {
    handlers: Vec<Box<dyn DispatchHandler>>,
}

impl DispatchEngine {
    pub fn new() -> Self {
        Self {
            handlers: vec![
                Box::new(StreamFanOutHandler),
                Box::new(PinPassThroughHandler),
            ],
        }
    }

    pub fn register_handler(&mut self, handler: Box<dyn DispatchHandler>) {
        self.handlers.push(handler);
    }

    /// Produce `n` independent copies of `value`.
    ///
    /// No cycle/shared-substructure cache: `DispatchValue` is an owned
    /// tree rebuilt fresh from wire-decoded bytes on every call (never a
    /// live graph with back-references), so no two paths in one dispatch
    /// can reach the same node and a dedup cache would never hit.
    pub fn dispatch(&self, value: DispatchValue, n: usize) -> Vec<DispatchValue> {
        if n == 0 {
            return Vec::new();
        }
        self.dispatch_inner(value, n)
    }

    fn dispatch_inner(&self, value: DispatchValue, n: usize) -> Vec<DispatchValue> {
        match value {
            DispatchValue::Scalar(bytes) => {
                let shared = Arc::new(bytes);
                (0..n)
                    .map(|_| DispatchValue::Scalar((*shared).clone()))
                    .collect()
            }
            DispatchValue::Seq(items) => {
                let mut columns: Vec<Vec<DispatchValue>> = vec![Vec::with_capacity(items.len()); n];
                for item in items {
                    let copies = self.dispatch_one(item, n);
                    for (col, copy) in columns.iter_mut().zip(copies) {
                        col.push(copy);
                    }
                }
                columns.into_iter().map(DispatchValue::Seq).collect()
            }
            DispatchValue::Map(fields) => {
                let mut columns: Vec<Vec<(String, DispatchValue)>> =
                    vec![Vec::with_capacity(fields.len()); n];
                for (key, field_value) in fields {
                    let copies = self.dispatch_one(field_value, n);
                    for (col, copy) in columns.iter_mut().zip(copies) {
                        col.push((key.clone(), copy));
                    }
                }
                columns.into_iter().map(DispatchValue::Map).collect()
            }
            other => self.dispatch_one(other, n),
        }
    }

    fn dispatch_one(&self, value: DispatchValue, n: usize) -> Vec<DispatchValue> {
        for handler in &self.handlers {
            if handler.can_handle(&value) {
                return handler.dispatch(value, n);
            }
        }
        self.dispatch_inner(value, n)
    }
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct StreamFanOutHandler;

impl DispatchHandler for StreamFanOutHandler {
    fn can_handle(&self, value: &DispatchValue) -> bool {
        matches!(value, DispatchValue::Stream(_))
    }

    fn dispatch(&self, value: DispatchValue, n: usize) -> Vec<DispatchValue> {
        let DispatchValue::Stream(mut source) = value else {
            unreachable!("can_handle guarantees Stream");
        };
        let mut senders = Vec::with_capacity(n);
        let mut proxies = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(16);
            senders.push(tx);
            proxies.push(StreamHandle { rx });
        }
        tokio::spawn(async move {
            loop {
                match source.next_chunk().await {
                    Some(Ok(chunk)) => {
                        let mut cancelled = false;
                        for tx in &senders {
                            if tx.send(StreamEvent::Chunk(chunk.clone())).await.is_err() {
                                cancelled = true;
                                break;
                            }
                        }
                        if cancelled {
                            // One consumer dropping its receiver aborts the
                            // shared source; siblings get an error, not a
                            // silent close indistinguishable from EOF.
                            for tx in &senders {
                                let _ = tx
                                    .send(StreamEvent::Errored(
                                        "sibling consumer cancelled the shared stream".to_string(),
                                    ))
                                    .await;
                            }
                            return;
                        }
                    }
                    Some(Err(reason)) => {
                        for tx in &senders {
                            let _ = tx.send(StreamEvent::Errored(reason.clone())).await;
                        }
                        return;
                    }
                    None => {
                        for tx in &senders {
                            let _ = tx.send(StreamEvent::Closed).await;
                        }
                        return;
                    }
                }
            }
        });
        proxies.into_iter().map(DispatchValue::Stream).collect()
    }
}

struct PinPassThroughHandler;

impl DispatchHandler for PinPassThroughHandler {
    fn can_handle(&self, value: &DispatchValue) -> bool {
        matches!(value, DispatchValue::Pin(_))
    }

    fn dispatch(&self, value: DispatchValue, n: usize) -> Vec<DispatchValue> {
        let DispatchValue::Pin(handle) = value else {
            unreachable!("can_handle guarantees Pin");
        };
        (0..n).map(|_| DispatchValue::Pin(handle.clone())).collect()
    }
}

/// Fan-in aggregation for the write side of a stream: N proxy sinks that
/// serialize every write onto one target sink, closing the target only
/// once all proxies have closed, and propagating the first abort reason
/// to every proxy's shared completion future.
pub struct SinkFanIn {
    inner: mpsc::Sender<Vec<u8>>,
    remaining: Arc<std::sync::atomic::AtomicUsize>,
    completion_tx: watch::Sender<Option<Result<(), String>>>,
}

#[derive(Clone)]
pub struct SinkProxy {
    inner: mpsc::Sender<Vec<u8>>,
    remaining: Arc<std::sync::atomic::AtomicUsize>,
    completion: watch::Receiver<Option<Result<(), String>>>,
    completion_tx: watch::Sender<Option<Result<(), String>>>,
}

impl SinkFanIn {
    /// `target` is driven to completion as proxies close; the returned
    /// `oneshot` resolves with the final outcome once every proxy has
    /// finished.
    pub fn new(target: mpsc::Sender<Vec<u8>>, n: usize) -> (Vec<SinkProxy>, oneshot::Receiver<Result<(), String>>) {
        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(n));
        let (completion_tx, completion_rx) = watch::channel(None);
        let (done_tx, done_rx) = oneshot::channel();

        let mut watcher = completion_rx.clone();
        tokio::spawn(async move {
            loop {
                if watcher.changed().await.is_err() {
                    return;
                }
                if let Some(outcome) = watcher.borrow().clone() {
                    let _ = done_tx.send(outcome);
                    return;
                }
            }
        });

        let proxies = (0..n)
            .map(|_| SinkProxy {
                inner: target.clone(),
                remaining: remaining.clone(),
                completion: completion_rx.clone(),
                completion_tx: completion_tx.clone(),
            })
            .collect();
        (proxies, done_rx)
    }
}

impl SinkProxy {
    pub async fn write(&self, chunk: Vec<u8>) -> Result<(), String> {
        self.inner
            .send(chunk)
            .await
            .map_err(|_| "sink closed".to_string())
    }

    /// Close this proxy. Once every proxy has closed, the shared
    /// completion future resolves successfully.
    pub fn close(&self) {
        use std::sync::atomic::Ordering;
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.completion_tx.send(Some(Ok(())));
        }
    }

    /// Abort this proxy. The target sink and every other proxy observe
    /// the same abort reason via the shared completion future.
    pub fn abort(&self, reason: String) {
        let _ = self.completion_tx.send(Some(Err(reason)));
    }

    pub async fn completion(&self) -> Result<(), String> {
        let mut rx = self.completion.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err("completion channel closed".to_string());
            }
        }
    }
}

/// Expose a `StreamHandle` as an idiomatic `tokio_stream::Stream` of
/// scalar chunks, used when a broadcast `ask` result set carries a
/// streamed value back to the caller.
pub fn stream_handle_into_stream(
    mut handle: StreamHandle,
) -> impl Stream<Item = Result<Vec<u8>, String>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(item) = handle.next_chunk().await {
            if tx.send(item).await.is_err() {
                return;
            }
        }
    });
    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_scalar_produces_n_independent_copies() {
        let engine = DispatchEngine::new();
        let copies = engine.dispatch(DispatchValue::Scalar(vec![1, 2, 3]), 3);
        assert_eq!(copies.len(), 3);
        for c in copies {
            match c {
                DispatchValue::Scalar(b) => assert_eq!(b, vec![1, 2, 3]),
                _ => panic!("expected scalar"),
            }
        }
    }

    #[test]
    fn dispatch_zero_targets_yields_empty_vec() {
        let engine = DispatchEngine::new();
        let copies = engine.dispatch(DispatchValue::Scalar(vec![1]), 0);
        assert!(copies.is_empty());
    }

    #[test]
    fn dispatch_seq_transposes_children_independently() {
        let engine = DispatchEngine::new();
        let value = DispatchValue::Seq(vec![
            DispatchValue::Scalar(vec![1]),
            DispatchValue::Scalar(vec![2]),
        ]);
        let copies = engine.dispatch(value, 2);
        assert_eq!(copies.len(), 2);
        for copy in copies {
            match copy {
                DispatchValue::Seq(items) => assert_eq!(items.len(), 2),
                _ => panic!("expected seq"),
            }
        }
    }

    #[test]
    fn dispatch_pin_never_clones_underlying_handle() {
        let engine = DispatchEngine::new();
        let handle = PinHandle(Arc::from("resource-1"));
        let copies = engine.dispatch(DispatchValue::Pin(handle), 3);
        assert_eq!(copies.len(), 3);
        for c in copies {
            match c {
                DispatchValue::Pin(h) => assert_eq!(&*h.0, "resource-1"),
                _ => panic!("expected pin"),
            }
        }
    }

    #[tokio::test]
    async fn stream_fan_out_delivers_every_chunk_to_every_proxy() {
        let engine = DispatchEngine::new();
        let source = StreamHandle::from_values(vec![vec![1], vec![2]]);
        let copies = engine.dispatch(DispatchValue::Stream(source), 2);
        assert_eq!(copies.len(), 2);
        let mut handles: Vec<StreamHandle> = copies
            .into_iter()
            .map(|c| match c {
                DispatchValue::Stream(h) => h,
                _ => panic!("expected stream"),
            })
            .collect();
        for handle in handles.iter_mut() {
            let mut collected = Vec::new();
            while let Some(chunk) = handle.next_chunk().await {
                collected.push(chunk.unwrap());
            }
            assert_eq!(collected, vec![vec![1], vec![2]]);
        }
    }

    #[tokio::test]
    async fn sink_fan_in_closes_target_only_after_all_proxies_close() {
        let (target_tx, mut target_rx) = mpsc::channel(16);
        let (proxies, done) = SinkFanIn::new(target_tx, 2);
        proxies[0].write(vec![1]).await.unwrap();
        proxies[0].close();
        // Target not yet closed: one proxy remains open.
        assert_eq!(target_rx.recv().await, Some(vec![1]));
        proxies[1].close();
        let outcome = done.await.unwrap();
        assert_eq!(outcome, Ok(()));
    }

    #[tokio::test]
    async fn sink_fan_in_abort_propagates_to_completion_future() {
        let (target_tx, _target_rx) = mpsc::channel(16);
        let (proxies, done) = SinkFanIn::new(target_tx, 2);
        proxies[0].abort("boom".to_string());
        let outcome = done.await.unwrap();
        assert_eq!(outcome, Err("boom".to_string()));
        assert_eq!(proxies[1].completion().await, Err("boom".to_string()));
    }
}
