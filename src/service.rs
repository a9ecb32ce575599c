//! Service: the process-wide registry, timer, and date cache

use crate::{conn::State, limits::HttpLimits, proto, stage::Stage};
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

/// Monitor counter ids.
pub const COUNTER_ACTIVE_REQUESTS: usize = 0;
pub const COUNTER_REQUESTS: usize = 1;
pub const COUNTER_NETWORK_IO: usize = 2;
pub const COUNTER_ACTIVE_CLIENTS: usize = 3;
const COUNTER_COUNT: usize = 4;

/// How often the service timer fires while connections exist.
pub(crate) const TIMER_PERIOD: Duration = Duration::from_secs(1);

/// A connection's registration with the service. The service holds the
/// ticket; the connection itself stays alive through its socket task.
/// The timer reads the atomics to enforce deadlines and signals the
/// `timeout` notifier to deliver a timeout event on the owning task.
pub struct ConnTicket {
    pub(crate) seqno: u64,
    pub(crate) server_side: bool,
    pub(crate) limits: Arc<HttpLimits>,
    state: AtomicU8,
    /// Milliseconds since service boot.
    started_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    timeout_pending: AtomicBool,
    pub(crate) timeout: Notify,
    /// Request URI for idle-state logging.
    pub(crate) uri: Mutex<String>,
    booted: Instant,
}

impl ConnTicket {
    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms
            .store(self.booted.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Re-arm deadlines for the next keep-alive request.
    pub(crate) fn restart(&self) {
        let now = self.booted.elapsed().as_millis() as u64;
        self.started_ms.store(now, Ordering::Relaxed);
        self.last_activity_ms.store(now, Ordering::Relaxed);
        self.timeout_pending.store(false, Ordering::Relaxed);
    }
}

struct Registry {
    connections: Vec<Arc<ConnTicket>>,
    stages: HashMap<&'static str, Arc<dyn Stage>>,
    /// Idle timeouts for registered stages; expired ones are marked
    /// unloaded by the timer until the next lookup re-arms them.
    stage_timeouts: HashMap<&'static str, (Instant, Duration)>,
    unloaded: HashSet<&'static str>,
    endpoints: Vec<SocketAddr>,
}

struct DateCache {
    stamp: Instant,
    value: String,
}

/// Totals snapshot for embedder reporting.
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub active_connections: usize,
    pub active_requests: i64,
    pub total_connections: u64,
    pub total_requests: u64,
}

/// Process-wide HTTP state shared by every connection, in both roles:
/// the stage table, live-connection registry, status code table, cached
/// HTTP date, monitor counters, and the periodic timer enforcing
/// timeouts.
pub struct Service {
    registry: Mutex<Registry>,
    date: Mutex<DateCache>,
    counters: [AtomicI64; COUNTER_COUNT],
    total_connections: AtomicU64,
    total_requests: AtomicU64,
    boundary_seq: AtomicU64,
    /// Debug mode suppresses timeout generation.
    debug_mode: AtomicBool,
    timer_running: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: Notify,
    booted: Instant,
    idle_logged: Mutex<Instant>,
}

impl Service {
    pub fn new() -> Arc<Self> {
        let booted = Instant::now();
        Arc::new(Self {
            registry: Mutex::new(Registry {
                connections: Vec::new(),
                stages: HashMap::new(),
                stage_timeouts: HashMap::new(),
                unloaded: HashSet::new(),
                endpoints: Vec::new(),
            }),
            date: Mutex::new(DateCache {
                stamp: booted,
                value: httpdate::fmt_http_date(SystemTime::now()),
            }),
            counters: Default::default(),
            total_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            boundary_seq: AtomicU64::new(0),
            debug_mode: AtomicBool::new(false),
            timer_running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown: Notify::new(),
            booted,
            idle_logged: Mutex::new(booted),
        })
    }

    /// Begin a graceful shutdown: endpoints stop accepting; in-flight
    /// connections drain under their normal timeouts. [`Self::is_idle`]
    /// reports when everything has retired.
    pub fn shutdown(&self) {
        info!("service shutting down");
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Resolves when [`Self::shutdown`] is called.
    pub(crate) async fn wait_shutdown(&self) {
        let mut notified = std::pin::pin!(self.shutdown.notified());
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    /// Suppress timeout generation, e.g. while stepping in a debugger.
    pub fn set_debug_mode(&self, on: bool) {
        self.debug_mode.store(on, Ordering::Relaxed);
    }

    // Stage registration

    /// Register a stage by name. Registration is immutable: a second
    /// registration under the same name replaces the first for new
    /// pipelines only.
    pub fn add_stage(&self, stage: Arc<dyn Stage>) {
        let mut registry = self.registry.lock().unwrap();
        registry.stages.insert(stage.name(), stage);
    }

    /// Look up a registered stage, re-arming it if the timer had marked
    /// it unloaded.
    pub fn lookup_stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        let mut registry = self.registry.lock().unwrap();
        let stage = registry.stages.get(name).cloned()?;
        if registry.unloaded.remove(stage.name()) {
            debug!(stage = name, "reloading stage");
        }
        if let Some((activity, _)) = registry.stage_timeouts.get_mut(stage.name()) {
            *activity = Instant::now();
        }
        Some(stage)
    }

    /// Mark a stage unloadable after `timeout` of process-wide
    /// inactivity.
    pub fn set_stage_timeout(&self, name: &'static str, timeout: Duration) {
        let mut registry = self.registry.lock().unwrap();
        registry
            .stage_timeouts
            .insert(name, (Instant::now(), timeout));
    }

    /// True when the timer has unloaded this stage.
    pub fn stage_unloaded(&self, name: &str) -> bool {
        self.registry.lock().unwrap().unloaded.contains(name)
    }

    // Connection registry

    pub(crate) fn add_conn(
        self: &Arc<Self>,
        server_side: bool,
        limits: Arc<HttpLimits>,
    ) -> Arc<ConnTicket> {
        let seqno = self.total_connections.fetch_add(1, Ordering::Relaxed);
        let now = self.booted.elapsed().as_millis() as u64;
        let ticket = Arc::new(ConnTicket {
            seqno,
            server_side,
            limits,
            state: AtomicU8::new(State::Begin as u8),
            started_ms: AtomicU64::new(now),
            last_activity_ms: AtomicU64::new(now),
            timeout_pending: AtomicBool::new(false),
            timeout: Notify::new(),
            uri: Mutex::new(String::new()),
            booted: self.booted,
        });
        self.registry
            .lock()
            .unwrap()
            .connections
            .push(ticket.clone());
        self.refresh_date();
        self.ensure_timer();
        ticket
    }

    pub(crate) fn remove_conn(&self, ticket: &Arc<ConnTicket>) {
        self.registry
            .lock()
            .unwrap()
            .connections
            .retain(|t| t.seqno != ticket.seqno);
    }

    pub(crate) fn add_endpoint(&self, addr: SocketAddr) {
        self.registry.lock().unwrap().endpoints.push(addr);
    }

    pub(crate) fn remove_endpoint(&self, addr: SocketAddr) {
        self.registry
            .lock()
            .unwrap()
            .endpoints
            .retain(|a| *a != addr);
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.registry.lock().unwrap().endpoints.clone()
    }

    // Counters

    /// Adjust a monitor counter and return its current value.
    pub fn monitor_event(&self, counter: usize, delta: i64) -> i64 {
        self.counters[counter].fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub(crate) fn count_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            active_connections: self.registry.lock().unwrap().connections.len(),
            active_requests: self.counters[COUNTER_ACTIVE_REQUESTS].load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
        }
    }

    /// Map a status code to its reason phrase; unknown codes render as
    /// `"Custom error"`.
    pub fn lookup_status(&self, code: u16) -> &'static str {
        proto::status_message(code)
    }

    /// A unique multipart boundary for range responses.
    pub(crate) fn next_boundary(&self) -> String {
        let seq = self.boundary_seq.fetch_add(1, Ordering::Relaxed);
        format!("pumpweb{:08x}", seq)
    }

    // Date cache

    /// The cached HTTP-date string, refreshed at most once per second and
    /// emitted in `Date:` headers without reformatting.
    pub fn current_date(&self) -> String {
        let mut cache = self.date.lock().unwrap();
        if cache.stamp.elapsed() >= Duration::from_secs(1) {
            cache.stamp = Instant::now();
            cache.value = httpdate::fmt_http_date(SystemTime::now());
        }
        cache.value.clone()
    }

    fn refresh_date(&self) {
        let _ = self.current_date();
    }

    // Idle detection

    /// True when every connection is at BEGIN and nothing is in flight.
    /// Busy connections are logged at most once per timer period.
    pub fn is_idle(&self) -> bool {
        let registry = self.registry.lock().unwrap();
        for ticket in &registry.connections {
            if ticket.state() != State::Begin {
                let mut logged = self.idle_logged.lock().unwrap();
                if logged.elapsed() >= TIMER_PERIOD {
                    let uri = ticket.uri.lock().unwrap();
                    if uri.is_empty() {
                        info!(seqno = ticket.seqno, "waiting for connection to close");
                    } else {
                        info!(seqno = ticket.seqno, uri = %uri, "request is still active");
                    }
                    *logged = Instant::now();
                }
                return false;
            }
        }
        true
    }

    // The timer

    /// Start the periodic timer if it is not already running. Fires once
    /// per second while any connection is registered; on the tick that
    /// finds no connections it expires idle stages and deregisters
    /// itself.
    fn ensure_timer(self: &Arc<Self>) {
        if self.timer_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime: deadlines are enforced by the connection
            // drivers alone
            self.timer_running.store(false, Ordering::Release);
            return;
        };
        let weak: Weak<Service> = Arc::downgrade(self);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(TIMER_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    return;
                };
                if !service.timer_tick() {
                    service.timer_running.store(false, Ordering::Release);
                    return;
                }
            }
        });
    }

    /// One maintenance pass. Returns false when the timer should stop.
    fn timer_tick(&self) -> bool {
        self.refresh_date();
        let debug_mode = self.debug_mode.load(Ordering::Relaxed);
        let now = self.booted.elapsed().as_millis() as u64;

        let mut registry = self.registry.lock().unwrap();
        let active = registry.connections.len();
        trace!(active, "service timer");

        for ticket in &registry.connections {
            if ticket.timeout_pending.load(Ordering::Relaxed) {
                continue;
            }
            let limits = &ticket.limits;
            let state = ticket.state();
            let started = ticket.started_ms.load(Ordering::Relaxed);
            let last_activity = ticket.last_activity_ms.load(Ordering::Relaxed);

            let parse_expired = ticket.server_side
                && state > State::Begin
                && state < State::Parsed
                && started + limits.request_parse_timeout.as_millis() as u64 <= now;
            let inactive = last_activity + limits.inactivity_timeout.as_millis() as u64 <= now;
            let request_expired = started + limits.request_timeout.as_millis() as u64 <= now;

            if (parse_expired || inactive || request_expired) && !debug_mode {
                debug!(
                    seqno = ticket.seqno,
                    parse_expired, inactive, request_expired, "connection timeout"
                );
                ticket.timeout_pending.store(true, Ordering::Relaxed);
                ticket.timeout.notify_one();
            }
        }

        if active == 0 {
            // Expire idle stages, then go back to sleep
            let expired: Vec<&'static str> = registry
                .stage_timeouts
                .iter()
                .filter(|(_, (activity, timeout))| activity.elapsed() >= *timeout)
                .map(|(name, _)| *name)
                .collect();
            for name in expired {
                if registry.unloaded.insert(name) {
                    info!(stage = name, "unloading inactive stage");
                }
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod service_self {
    use super::*;

    #[test]
    fn status_lookup_falls_back() {
        let service = Service::new();
        assert_eq!(service.lookup_status(200), "OK");
        assert_eq!(service.lookup_status(550), "Comms Error");
        assert_eq!(service.lookup_status(299), "Custom error");
    }

    #[test]
    fn connection_registry_counts() {
        let service = Service::new();
        let limits = Arc::new(HttpLimits::server_defaults());

        let a = service.add_conn(true, limits.clone());
        let b = service.add_conn(false, limits);
        assert_eq!(service.stats().active_connections, 2);
        assert_eq!(service.stats().total_connections, 2);
        assert_eq!(a.seqno, 0);
        assert_eq!(b.seqno, 1);

        service.remove_conn(&a);
        service.remove_conn(&a); // idempotent
        assert_eq!(service.stats().active_connections, 1);
        assert_eq!(service.stats().total_connections, 2);
    }

    #[test]
    fn idle_requires_begin_state() {
        let service = Service::new();
        let limits = Arc::new(HttpLimits::server_defaults());
        assert!(service.is_idle());

        let ticket = service.add_conn(true, limits);
        assert!(service.is_idle());

        ticket.set_state(State::Content);
        assert!(!service.is_idle());

        service.remove_conn(&ticket);
        assert!(service.is_idle());
    }

    #[test]
    fn monitor_counters() {
        let service = Service::new();
        assert_eq!(service.monitor_event(COUNTER_ACTIVE_REQUESTS, 1), 1);
        assert_eq!(service.monitor_event(COUNTER_ACTIVE_REQUESTS, 1), 2);
        assert_eq!(service.monitor_event(COUNTER_ACTIVE_REQUESTS, -1), 1);
    }

    #[test]
    fn date_cache_is_reused_within_a_second() {
        let service = Service::new();
        let first = service.current_date();
        let second = service.current_date();
        assert_eq!(first, second);
        assert!(httpdate::parse_http_date(&first).is_ok());
    }

    #[test]
    fn timer_tick_marks_expired_connections() {
        let service = Service::new();
        let limits = Arc::new(HttpLimits {
            inactivity_timeout: Duration::from_millis(0),
            ..HttpLimits::server_defaults()
        });
        let ticket = service.add_conn(true, limits);
        ticket.set_state(State::Content);

        assert!(service.timer_tick());
        assert!(ticket.timeout_pending.load(Ordering::Relaxed));

        // Debug mode suppresses generation
        let service = Service::new();
        service.set_debug_mode(true);
        let limits = Arc::new(HttpLimits {
            inactivity_timeout: Duration::from_millis(0),
            ..HttpLimits::server_defaults()
        });
        let ticket = service.add_conn(true, limits);
        assert!(service.timer_tick());
        assert!(!ticket.timeout_pending.load(Ordering::Relaxed));
    }

    #[test]
    fn shutdown_is_sticky() {
        let service = Service::new();
        assert!(!service.is_shutting_down());
        service.shutdown();
        assert!(service.is_shutting_down());
    }

    #[test]
    fn stage_unload_cycle() {
        struct Nop;
        impl Stage for Nop {
            fn name(&self) -> &'static str {
                "nop"
            }
        }

        let service = Service::new();
        service.add_stage(Arc::new(Nop));
        service.set_stage_timeout("nop", Duration::from_millis(0));

        // No connections: the tick expires the stage and stops the timer
        assert!(!service.timer_tick());
        assert!(service.stage_unloaded("nop"));

        // Lookup re-arms it
        assert!(service.lookup_stage("nop").is_some());
        assert!(!service.stage_unloaded("nop"));
        assert!(service.lookup_stage("missing").is_none());
    }
}
