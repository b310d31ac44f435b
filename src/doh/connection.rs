//! One long-lived HTTP/2-over-TLS session to a single upstream IP.
//!
//! The `h2` crate owns the bytes on the wire; this module owns the lifecycle
//! (`Dialing → Connected → Draining → Exited`), the stream admission gate,
//! and the idle-deadline machine that decides when a quiet connection gets
//! torn down.

use crate::answer::DnsAnswer;
use crate::error::{ResolveError, Result};
use bytes::Bytes;
use h2::client::SendRequest;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// At most this many locally initiated streams in flight per connection; one
/// stalled stream must not starve the rest of a small multiplexing window.
const MAX_CONCURRENT_STREAMS: usize = 3;
/// Cooperative wait slice while the admission gate is full.
const ADMISSION_SLICE: Duration = Duration::from_millis(10);
/// Hard deadline a new request imposes on the whole connection.
const REQUEST_DEADLINE: Duration = Duration::from_secs(2);
/// Deadline extension granted per success while other streams are in flight.
const SUCCESS_EXTENSION: Duration = Duration::from_secs(10);
/// Successful exchanges after which the deadline stops being extended; some
/// providers silently cap request counts per connection.
const EXTENSION_CAP: u64 = 100;
/// Budget for deregistration and teardown once the connection is draining.
const CLEANUP_BUDGET: Duration = Duration::from_secs(1);
/// Stand-in for "no deadline".
const FAR_FUTURE: Duration = Duration::from_secs(365 * 86_400);

type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;
/// The future that drives the session's I/O; it must be polled for the
/// lifetime of the connection.
pub type H2Driver = h2::client::Connection<TlsStream, Bytes>;

/// Stream admission and deadline bookkeeping for one session, kept apart
/// from the transport so the gate and deadline rules can be exercised
/// without a live connection.
struct SessionState {
    in_flight: AtomicUsize,
    attempted: AtomicU64,
    successes: AtomicU64,
    /// Deadline for the whole connection; tightened by new requests, pushed
    /// out by successes.
    deadline: Mutex<Instant>,
    deadline_changed: Notify,
}

impl SessionState {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            attempted: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            deadline: Mutex::new(Instant::now() + FAR_FUTURE),
            deadline_changed: Notify::new(),
        }
    }

    /// Take a stream slot unless the admission cap is already reached.
    fn try_acquire(&self) -> Option<StreamSlot<'_>> {
        self.in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |held| {
                (held < MAX_CONCURRENT_STREAMS).then_some(held + 1)
            })
            .ok()
            .map(|_| StreamSlot {
                counter: &self.in_flight,
            })
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// A new request tightens the session deadline to at most 2 s out; it
    /// never pushes an earlier deadline back.
    fn begin_request(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        let cap = Instant::now() + REQUEST_DEADLINE;
        let mut deadline = self.deadline.lock();
        if *deadline > cap {
            *deadline = cap;
            self.deadline_changed.notify_waiters();
        }
    }

    /// A success pushes the deadline out: +10 s while other streams are in
    /// flight, unbounded otherwise. Stops at the extension cap; requests
    /// keep being served past it.
    fn record_success(&self) {
        let successes = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes > EXTENSION_CAP {
            return;
        }
        let mut deadline = self.deadline.lock();
        // The caller's own slot is still held here, so >1 means other
        // streams remain.
        *deadline = if self.in_flight() > 1 {
            *deadline + SUCCESS_EXTENSION
        } else {
            Instant::now() + FAR_FUTURE
        };
        self.deadline_changed.notify_waiters();
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }
}

pub struct DohConnection {
    provider: String,
    host: String,
    path: String,
    peer: IpAddr,
    send_request: SendRequest<Bytes>,
    state: SessionState,
    cancel: watch::Sender<bool>,
    exited: AtomicBool,
    exited_tx: watch::Sender<bool>,
}

impl DohConnection {
    /// Dial `ip`, complete the TLS and HTTP/2 handshakes, and return the
    /// connection together with its I/O driver. The caller registers the
    /// connection and spawns [`DohConnection::run`] with the driver.
    pub async fn connect(
        provider: &str,
        host: &str,
        path: &str,
        ip: IpAddr,
        tls: Arc<rustls::ClientConfig>,
    ) -> Result<(Arc<Self>, H2Driver)> {
        debug!("[{provider}] trying {ip}");
        let tcp = TcpStream::connect(SocketAddr::new(ip, 443)).await?;
        tcp.set_nodelay(true)?;

        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| ResolveError::Tls(format!("invalid SNI host {host}")))?;
        let stream = TlsConnector::from(tls).connect(server_name, tcp).await?;
        {
            let (_, session) = stream.get_ref();
            if session.alpn_protocol() != Some(b"h2".as_slice()) {
                return Err(ResolveError::Tls(format!(
                    "{host} ({ip}) did not negotiate h2"
                )));
            }
        }

        let (send_request, driver) = h2::client::handshake(stream)
            .await
            .map_err(h2_error)?;
        info!("[{provider}] {ip} connected");

        let connection = Arc::new(Self {
            provider: provider.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            peer: ip,
            send_request,
            state: SessionState::new(),
            cancel: watch::channel(false).0,
            exited: AtomicBool::new(false),
            exited_tx: watch::channel(false).0,
        });
        Ok((connection, driver))
    }

    /// Drive the session until the peer closes it, the idle deadline lapses,
    /// or the supervisor cancels it; then drain and deregister from
    /// `registry` under a shielded one-second cleanup budget.
    pub async fn run(self: Arc<Self>, driver: H2Driver, registry: Arc<Mutex<Vec<Arc<Self>>>>) {
        let started = Instant::now();
        let mut cancel_rx = self.cancel.subscribe();
        let sleep = tokio::time::sleep_until(self.state.deadline());
        tokio::pin!(sleep);
        tokio::pin!(driver);

        let reason = loop {
            tokio::select! {
                result = &mut driver => {
                    break match result {
                        Ok(()) => "peer closed the connection".to_string(),
                        Err(e) if e.is_go_away() => "peer sent GOAWAY".to_string(),
                        Err(e) => format!("transport error: {e}"),
                    };
                }
                _ = &mut sleep => {
                    let deadline = self.state.deadline();
                    if Instant::now() >= deadline {
                        break "idle deadline".to_string();
                    }
                    sleep.as_mut().reset(deadline);
                }
                _ = self.state.deadline_changed.notified() => {
                    sleep.as_mut().reset(self.state.deadline());
                }
                _ = cancel_rx.wait_for(|canceled| *canceled) => {
                    break "canceled by us".to_string();
                }
            }
        };

        // Draining → Exited. Cleanup must not be lost to a racing shutdown.
        let cleanup = async {
            registry.lock().retain(|c| !Arc::ptr_eq(c, &self));
            self.exited.store(true, Ordering::Release);
            self.exited_tx.send_replace(true);
        };
        if tokio::time::timeout(CLEANUP_BUDGET, cleanup).await.is_err() {
            warn!("[{}] {} cleanup overran its budget", self.provider, self.peer);
        }

        let attempted = self.state.attempted.load(Ordering::Relaxed);
        let successes = self.state.successes.load(Ordering::Relaxed);
        let requests = if attempted > 0 {
            format!("requests OK {successes}/{attempted}")
        } else {
            "no requests done".to_string()
        };
        info!(
            "[{}] {} {} after {:.2} s, {}",
            self.provider,
            self.peer,
            reason,
            started.elapsed().as_secs_f64(),
            requests,
        );
    }

    /// Ask the connection task to exit.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Wait until the connection task has finished its cleanup.
    pub async fn wait_exited(&self) {
        let mut rx = self.exited_tx.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    pub fn successes(&self) -> u64 {
        self.state.successes.load(Ordering::Relaxed)
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    /// Issue one DoH request on this session.
    pub async fn resolve(&self, query: &crate::answer::DnsQuery) -> Result<DnsAnswer> {
        if self.is_exited() {
            return Err(ResolveError::ConnectionGone);
        }
        // Admission gate: cooperative wait for a stream slot.
        let _slot = loop {
            match self.state.try_acquire() {
                Some(slot) => break slot,
                None => {
                    tokio::time::sleep(ADMISSION_SLICE).await;
                    if self.is_exited() {
                        return Err(ResolveError::ConnectionGone);
                    }
                }
            }
        };
        self.state.begin_request();

        let uri = format!(
            "https://{}{}?name={}&type={}&do={}",
            self.host,
            self.path,
            query.qname,
            query.qtype,
            query.do_flag as u8,
        );
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(&uri)
            .header(http::header::ACCEPT, "application/dns-json")
            .body(())
            .map_err(|e| ResolveError::BadHttp(e.to_string()))?;

        let sender = self.send_request.clone();
        let mut sender = sender.ready().await.map_err(h2_error)?;
        let (response, _) = sender.send_request(request, true).map_err(h2_error)?;
        let response = response.await.map_err(h2_error)?;

        let (parts, mut body) = response.into_parts();
        if parts.status != http::StatusCode::OK {
            return Err(ResolveError::BadHttp(format!("HTTP {}", parts.status)));
        }
        let content_type = parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("json") && !content_type.contains("javascript") {
            return Err(ResolveError::BadHttp(format!(
                "non-JSON content-type {content_type:?}"
            )));
        }

        let mut data = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(h2_error)?;
            let _ = body.flow_control().release_capacity(chunk.len());
            data.extend_from_slice(&chunk);
        }

        let value: serde_json::Value = serde_json::from_slice(&data)
            .map_err(|e| ResolveError::BadHttp(format!("undecodable body: {e}")))?;
        if !value.is_object() {
            return Err(ResolveError::BadHttp("body is not a JSON object".to_string()));
        }
        let mut answer: DnsAnswer = serde_json::from_value(value)
            .map_err(|e| ResolveError::BadHttp(format!("unexpected JSON shape: {e}")))?;
        answer.name_client = self.provider.clone();

        self.state.record_success();
        Ok(answer)
    }
}

/// RAII stream-slot token for the admission gate.
struct StreamSlot<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for StreamSlot<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

fn h2_error(e: h2::Error) -> ResolveError {
    if e.is_reset() {
        ResolveError::StreamReset
    } else if e.is_io() || e.is_go_away() {
        ResolveError::ConnectionGone
    } else {
        ResolveError::BadHttp(e.to_string())
    }
}
