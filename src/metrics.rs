//! Process metrics registry, in the shape of the teacher's
//! `create_metrics()`, extended with COUNT and ban-table counters the
//! teacher didn't have (spec.md §4.6, §4.2 COUNT command).
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct NostrMetrics {
    pub query_sub: Histogram,
    pub query_db: Histogram,
    pub write_events: Histogram,
    pub sent_events: IntCounterVec,
    pub connections: IntCounter,
    pub disconnects: IntCounterVec,
    pub query_aborts: IntCounterVec,
    pub cmd_req: IntCounter,
    pub cmd_event: IntCounter,
    pub cmd_close: IntCounter,
    pub cmd_count: IntCounter,
    pub spams: IntCounterVec,
    pub bans_total: IntCounter,
    pub connections_refused: IntCounterVec,
}

/// Build a fresh registry and the metrics struct registered against it.
/// Panics only on prometheus metric construction errors, which can only
/// happen from a malformed literal name/help string, never at runtime.
#[must_use]
pub fn create_metrics() -> (Registry, NostrMetrics) {
    let registry = Registry::new();

    let query_sub = Histogram::with_opts(HistogramOpts::new(
        "nostr_query_seconds",
        "Subscription response times",
    ))
    .unwrap();
    let query_db = Histogram::with_opts(HistogramOpts::new(
        "nostr_filter_seconds",
        "Filter query times",
    ))
    .unwrap();
    let write_events = Histogram::with_opts(HistogramOpts::new(
        "nostr_events_write_seconds",
        "Event writing response times",
    ))
    .unwrap();
    let sent_events = IntCounterVec::new(
        Opts::new("nostr_events_sent_total", "Events sent to clients"),
        &["source"],
    )
    .unwrap();
    let connections =
        IntCounter::with_opts(Opts::new("nostr_connections_total", "New connections")).unwrap();
    let query_aborts = IntCounterVec::new(
        Opts::new("nostr_query_abort_total", "Aborted queries"),
        &["reason"],
    )
    .unwrap();
    let cmd_req = IntCounter::with_opts(Opts::new("nostr_cmd_req_total", "REQ commands")).unwrap();
    let cmd_event =
        IntCounter::with_opts(Opts::new("nostr_cmd_event_total", "EVENT commands")).unwrap();
    let cmd_close =
        IntCounter::with_opts(Opts::new("nostr_cmd_close_total", "CLOSE commands")).unwrap();
    let cmd_count =
        IntCounter::with_opts(Opts::new("nostr_cmd_count_total", "COUNT commands")).unwrap();
    let disconnects = IntCounterVec::new(
        Opts::new("nostr_disconnects_total", "Client disconnects"),
        &["reason"],
    )
    .unwrap();
    let spams = IntCounterVec::new(
        Opts::new("nostr_spams_total", "EVENT spams"),
        &["author"],
    )
    .unwrap();
    let bans_total =
        IntCounter::with_opts(Opts::new("nostr_bans_total", "Addresses banned")).unwrap();
    let connections_refused = IntCounterVec::new(
        Opts::new("nostr_connections_refused_total", "Refused connection attempts"),
        &["reason"],
    )
    .unwrap();

    registry.register(Box::new(query_sub.clone())).unwrap();
    registry.register(Box::new(query_db.clone())).unwrap();
    registry.register(Box::new(write_events.clone())).unwrap();
    registry.register(Box::new(sent_events.clone())).unwrap();
    registry.register(Box::new(connections.clone())).unwrap();
    registry.register(Box::new(query_aborts.clone())).unwrap();
    registry.register(Box::new(cmd_req.clone())).unwrap();
    registry.register(Box::new(cmd_event.clone())).unwrap();
    registry.register(Box::new(cmd_close.clone())).unwrap();
    registry.register(Box::new(cmd_count.clone())).unwrap();
    registry.register(Box::new(disconnects.clone())).unwrap();
    registry.register(Box::new(spams.clone())).unwrap();
    registry.register(Box::new(bans_total.clone())).unwrap();
    registry.register(Box::new(connections_refused.clone())).unwrap();

    let metrics = NostrMetrics {
        query_sub,
        query_db,
        write_events,
        sent_events,
        connections,
        disconnects,
        query_aborts,
        cmd_req,
        cmd_event,
        cmd_close,
        cmd_count,
        spams,
        bans_total,
        connections_refused,
    };
    (registry, metrics)
}
