//! The per-remote-node RPC client: outbound marshaling, the pending-call
//! registry, reconnect-with-backoff, and the oldest-first timeout sweep
//! (spec.md §4.3).
//!
//! Grounded on `rpc/client.go`'s `Client`: a `pending` map keyed by sequence
//! plus a creation-ordered list for the sweep, both behind one lock whose
//! critical sections are O(1) (spec.md §5). The Rust version swaps the
//! intrusive `container/list.List` for a `VecDeque<u64>` of sequence numbers
//! with lazy removal — a response or a sweep hit removes the entry from the
//! map only; the sweep (the sole reader of the deque) skips front entries no
//! longer present in the map. That keeps both structures' mutations O(1)
//! without an intrusive linked list, at the cost of the deque slowly
//! accumulating already-settled seqs until the sweep walks past them, which
//! it does every tick regardless.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Instant;

use node_wire::{Frame, ProcessorRegistry, RequestFrame};

use crate::error::{CoreError, Result};
use crate::service::tree::{CallCallback, LoopHandle};

/// Where a completed call's result is delivered.
enum Delivery {
    /// A blocking `LoopHandle::call` waiting on this channel.
    Sync(oneshot::Sender<Result<serde_json::Value>>),
    /// An `async_call` callback, run on `caller`'s loop once delivered.
    Async {
        caller: LoopHandle,
        callback: CallCallback,
    },
}

struct PendingCall {
    service_method: String,
    created_at: Instant,
    /// This call's own deadline, which may differ from
    /// `RpcClientConfig::call_timeout` when the caller passed a per-call
    /// override; the sweep checks each entry against its own `timeout`
    /// rather than a single registry-wide value.
    timeout: Duration,
    delivery: Delivery,
}

#[derive(Default)]
struct PendingRegistry {
    map: HashMap<u64, PendingCall>,
    order: VecDeque<u64>,
}

impl PendingRegistry {
    fn insert(&mut self, seq: u64, call: PendingCall) {
        self.order.push_back(seq);
        self.map.insert(seq, call);
    }

    fn remove(&mut self, seq: u64) -> Option<PendingCall> {
        self.map.remove(&seq)
    }

    /// Drains every still-live entry, in no particular order, for the
    /// disconnect path (spec.md's `Client` invariant: "on disconnect, every
    /// pending call is failed... before the map is cleared").
    fn drain_all(&mut self) -> Vec<PendingCall> {
        self.order.clear();
        self.map.drain().map(|(_, v)| v).collect()
    }

    /// Walks the FIFO oldest-first, stopping at the first still-fresh entry
    /// (spec.md §4.3's "the list is ordered by creation, the sweep stops at
    /// the first still-fresh entry"), bounded by `max_checks` ticks to avoid
    /// stalling the sweep task on a pathologically long queue. Each entry is
    /// checked against its own `timeout`, so a per-call override is honored
    /// even though the queue itself stays ordered by creation time.
    fn sweep_timed_out(&mut self, now: Instant, max_checks: usize) -> Vec<(u64, PendingCall)> {
        let mut timed_out = Vec::new();
        for _ in 0..max_checks {
            let Some(&seq) = self.order.front() else {
                break;
            };
            let Some(call) = self.map.get(&seq) else {
                // Already settled by a response; drop the stale FIFO entry
                // and keep walking without counting it as "still fresh".
                self.order.pop_front();
                continue;
            };
            if now.saturating_duration_since(call.created_at) <= call.timeout {
                break;
            }
            self.order.pop_front();
            let call = self.map.remove(&seq).unwrap();
            timed_out.push((seq, call));
        }
        timed_out
    }
}

pub struct RpcClientConfig {
    pub call_timeout: Duration,
    pub reconnect_interval: Duration,
    pub sweep_interval: Duration,
    pub max_checks_per_sweep: usize,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(15),
            reconnect_interval: Duration::from_secs(2),
            // Finer-grained than the sampled source's 3s sweep: spec.md's own
            // scenario 3 ("completion with Timeout within 200-400ms") needs
            // sub-second resolution, so the default here is tightened rather
            // than copied verbatim.
            sweep_interval: Duration::from_millis(50),
            max_checks_per_sweep: 1000,
        }
    }
}

/// One per remote node, reused for every outbound call to that node.
pub struct RpcClient {
    node_id: u64,
    addr: String,
    config: RpcClientConfig,
    seq: AtomicU64,
    pending: Mutex<PendingRegistry>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    processors: ProcessorRegistry,
}

impl RpcClient {
    /// Spawns the background reconnect loop and the timeout sweeper, and
    /// returns a handle good for issuing calls immediately (they queue
    /// behind the pending registry and fail with `Disconnected` until the
    /// first connection succeeds).
    pub fn spawn(node_id: u64, addr: String, config: RpcClientConfig) -> Arc<Self> {
        let client = Arc::new(Self {
            node_id,
            addr,
            seq: AtomicU64::new(0),
            pending: Mutex::new(PendingRegistry::default()),
            write_half: Mutex::new(None),
            connected: AtomicBool::new(false),
            config,
            processors: ProcessorRegistry::default(),
        });

        tokio::spawn(Arc::clone(&client).reconnect_loop());
        tokio::spawn(Arc::clone(&client).sweep_loop());
        client
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn generate_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Blocking-style call: registers a pending entry, writes the frame, and
    /// waits for the response/timeout/disconnect to settle it. Exactly one
    /// of those three settles any given call (spec.md §8 invariant 1).
    pub async fn call(
        &self,
        service_method: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let seq = self.generate_seq();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                seq,
                PendingCall {
                    service_method: service_method.to_owned(),
                    created_at: Instant::now(),
                    timeout: self.config.call_timeout,
                    delivery: Delivery::Sync(tx),
                },
            );
        }

        if let Err(e) = self.write_request(seq, service_method, payload, false).await {
            self.pending.lock().unwrap().remove(seq);
            return Err(e);
        }

        rx.await.map_err(|_| CoreError::Disconnected(self.node_id))?
    }

    /// Non-blocking call: `callback` runs on `caller`'s loop once the reply
    /// (or a terminal error) arrives; this method itself returns as soon as
    /// the request is registered and the frame is written. `timeout` is the
    /// caller's per-call deadline override, honored by the sweep rather than
    /// the registry-wide `RpcClientConfig::call_timeout`.
    pub fn async_call(
        self: &Arc<Self>,
        caller: LoopHandle,
        service_method: &str,
        payload: serde_json::Value,
        timeout: Duration,
        callback: CallCallback,
    ) -> Result<()> {
        let seq = self.generate_seq();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                seq,
                PendingCall {
                    service_method: service_method.to_owned(),
                    created_at: Instant::now(),
                    timeout,
                    delivery: Delivery::Async { caller, callback },
                },
            );
        }

        let this = Arc::clone(self);
        let service_method = service_method.to_owned();
        tokio::spawn(async move {
            if let Err(e) = this.write_request(seq, &service_method, payload, false).await {
                if let Some(call) = this.pending.lock().unwrap().remove(seq) {
                    deliver(call, Err(e));
                }
            }
        });
        Ok(())
    }

    /// One-way call: bypasses the pending registry entirely; returns once
    /// the frame is written (or immediately fails if there's no connection).
    pub async fn send(&self, service_method: &str, payload: serde_json::Value) -> Result<()> {
        let seq = self.generate_seq();
        self.write_request(seq, service_method, payload, true).await
    }

    async fn write_request(
        &self,
        seq: u64,
        service_method: &str,
        payload: serde_json::Value,
        no_reply: bool,
    ) -> Result<()> {
        let frame = Frame::Request(RequestFrame {
            seq,
            service_method: service_method.to_owned(),
            no_reply,
            payload,
            addition: None,
        });
        let processor = self.processors.default_processor();
        let body = processor.encode(&frame)?;
        if body.len() > node_wire::MAX_BODY_LEN {
            return Err(CoreError::Marshal(node_wire::WireError::TooLarge(body.len())));
        }

        let mut framed = Vec::with_capacity(3 + body.len());
        framed.extend_from_slice(&(body.len() as u16).to_le_bytes());
        framed.push(processor.id());
        framed.extend_from_slice(&body);

        let mut guard = self.write_half.lock().unwrap();
        // `write_all` is synchronous framing of data we already hold, but
        // the socket write itself must await; take the handle out, write,
        // then put it back to avoid holding a std mutex across an await.
        let Some(mut half) = guard.take() else {
            return Err(CoreError::Disconnected(self.node_id));
        };
        drop(guard);
        let result = half.write_all(&framed).await;
        let mut guard = self.write_half.lock().unwrap();
        match result {
            | Ok(()) => {
                *guard = Some(half);
                Ok(())
            },
            | Err(_) => {
                // Leave `write_half` empty; the reconnect loop owns
                // re-establishing the connection and draining `pending`.
                Err(CoreError::Disconnected(self.node_id))
            },
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            match TcpStream::connect(&self.addr).await {
                | Ok(stream) => {
                    tracing::info!(node_id = self.node_id, addr = %self.addr, "rpc client connected");
                    let (read_half, write_half) = stream.into_split();
                    *self.write_half.lock().unwrap() = Some(write_half);
                    self.connected.store(true, Ordering::Release);

                    self.read_loop(read_half).await;

                    self.connected.store(false, Ordering::Release);
                    *self.write_half.lock().unwrap() = None;
                    self.fail_all_pending();
                    tracing::warn!(node_id = self.node_id, "rpc client disconnected");
                },
                | Err(e) => {
                    tracing::debug!(node_id = self.node_id, error = %e, "rpc client connect failed");
                },
            }
            tokio::time::sleep(self.config.reconnect_interval).await;
        }
    }

    async fn read_loop(&self, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        loop {
            let mut len_buf = [0u8; 2];
            if read_half.read_exact(&mut len_buf).await.is_err() {
                return;
            }
            let len = u16::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; 1 + len];
            if read_half.read_exact(&mut body).await.is_err() {
                return;
            }

            let processor = match self.processors.get(body[0]) {
                | Ok(p) => p,
                | Err(e) => {
                    tracing::error!(error = %e, "unknown processor id on rpc client read path");
                    continue;
                },
            };
            let frame = match processor.decode(&body[1..]) {
                | Ok(f) => f,
                | Err(e) => {
                    tracing::error!(error = %e, "failed to decode rpc response frame");
                    continue;
                },
            };

            let node_wire::Frame::Response(response) = frame else {
                tracing::error!("rpc client received a request frame on the client socket");
                continue;
            };

            let call = self.pending.lock().unwrap().remove(response.seq);
            match call {
                | Some(call) => {
                    let result = match response.error {
                        | Some(message) => Err(CoreError::Handler(message)),
                        | None => Ok(response.payload),
                    };
                    deliver(call, result);
                },
                | None => {
                    tracing::debug!(seq = response.seq, "rpc client: no pending entry for response seq (late or already timed out)");
                },
            }
        }
    }

    fn fail_all_pending(&self) {
        let calls = self.pending.lock().unwrap().drain_all();
        for call in calls {
            deliver(call, Err(CoreError::Disconnected(self.node_id)));
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            ticker.tick().await;
            let timed_out = self
                .pending
                .lock()
                .unwrap()
                .sweep_timed_out(Instant::now(), self.config.max_checks_per_sweep);
            for (seq, call) in timed_out {
                let elapsed = Instant::now().saturating_duration_since(call.created_at);
                let service_method = call.service_method.clone();
                tracing::debug!(seq, service_method = %service_method, ?elapsed, "rpc call timed out");
                deliver(call, Err(CoreError::Timeout { service_method, elapsed }));
            }
        }
    }
}

fn deliver(call: PendingCall, result: Result<serde_json::Value>) {
    match call.delivery {
        | Delivery::Sync(tx) => {
            let _ = tx.send(result);
        },
        | Delivery::Async { caller, callback } => {
            if caller.enqueue_call_completed(callback, result).is_err() {
                tracing::warn!("dropped async-call callback: caller's inbound queue is gone");
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_delivery() -> Delivery {
        let (tx, _rx) = oneshot::channel();
        Delivery::Sync(tx)
    }

    #[test]
    fn sweep_stops_at_first_fresh_entry() {
        let mut registry = PendingRegistry::default();
        let base = Instant::now();
        registry.insert(
            1,
            PendingCall {
                service_method: "Math.Add".into(),
                created_at: base - Duration::from_secs(10),
                timeout: Duration::from_secs(1),
                delivery: noop_delivery(),
            },
        );
        registry.insert(
            2,
            PendingCall {
                service_method: "Math.Add".into(),
                created_at: base,
                timeout: Duration::from_secs(1),
                delivery: noop_delivery(),
            },
        );

        let timed_out = registry.sweep_timed_out(base, 1000);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].0, 1);
        assert!(registry.map.contains_key(&2));
    }

    #[test]
    fn sweep_is_bounded_by_max_checks() {
        let mut registry = PendingRegistry::default();
        let base = Instant::now();
        for seq in 0..10 {
            registry.insert(
                seq,
                PendingCall {
                    service_method: "Math.Add".into(),
                    created_at: base - Duration::from_secs(10),
                    timeout: Duration::from_secs(1),
                    delivery: noop_delivery(),
                },
            );
        }
        let timed_out = registry.sweep_timed_out(base, 3);
        assert_eq!(timed_out.len(), 3);
    }

    #[test]
    fn drain_all_empties_both_structures() {
        let mut registry = PendingRegistry::default();
        registry.insert(
            1,
            PendingCall {
                service_method: "Math.Add".into(),
                created_at: Instant::now(),
                timeout: Duration::from_secs(1),
                delivery: noop_delivery(),
            },
        );
        let drained = registry.drain_all();
        assert_eq!(drained.len(), 1);
        assert!(registry.map.is_empty());
        assert!(registry.order.is_empty());
    }
}
