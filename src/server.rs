//! Server process: HTTP/WebSocket front door, connection lifecycle, and
//! the per-connection command loop (spec.md §4.1, §4.2, §5).
use crate::ban::{self, BanTable};
use crate::close::{Close, CloseCmd};
use crate::config::Settings;
use crate::conn::{self, ClientConn};
use crate::count::CountCmd;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::event::{Event, EventCmd};
use crate::http_util::get_header_string;
use crate::identity::RelayIdentity;
use crate::info::RelayInfo;
use crate::limiter::ConnLimiter;
use crate::metrics::{create_metrics, NostrMetrics};
use crate::notice::Notice;
use crate::repo::NostrRepo;
use crate::subscription::Subscription;
use crate::validator;
use futures::SinkExt;
use futures::StreamExt;
use hyper::header::ACCEPT;
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{header, server::conn::AddrStream, upgrade, Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::runtime::Builder;
use tokio::sync::broadcast::{self, Receiver};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};
use tungstenite::error::CapacityError::MessageTooLong;
use tungstenite::error::Error as WsError;
use tungstenite::handshake;
use tungstenite::protocol::{Message, WebSocketConfig};

/// Max connection lifetime, regardless of activity (spec.md §4.1).
const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
/// Close with "no pong" if no inbound activity (including pong frames)
/// arrives within this long after a ping (spec.md §4.1).
const PONG_TIMEOUT: Duration = Duration::from_secs(90);
/// Cadence of the background expiration sweep (spec.md §4.4).
const EXPIRATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Handle arbitrary HTTP requests, including `WebSocket` upgrades.
#[allow(clippy::too_many_arguments)]
async fn handle_web_request(
    mut request: Request<Body>,
    repo: Arc<dyn NostrRepo>,
    settings: Settings,
    remote_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    ban_table: Arc<BanTable>,
    active_connections: Arc<AtomicUsize>,
    relay_info: RelayInfo,
    shutdown: Receiver<()>,
    registry: Registry,
    metrics: NostrMetrics,
) -> std::result::Result<Response<Body>, Infallible> {
    match (
        request.uri().path(),
        request.headers().contains_key(header::UPGRADE),
    ) {
        ("/", true) => {
            trace!("websocket upgrade request from {}", remote_addr);
            let origin = get_header_string("origin", request.headers());
            let user_agent = get_header_string("user-agent", request.headers());
            let remote_ip = conn::resolve_remote_ip(
                request.headers(),
                remote_addr,
                settings.network.remote_ip_header.as_deref(),
            );

            let now = SystemTime::now();
            if ban_table.is_banned(&remote_ip, now) {
                metrics.connections_refused.with_label_values(&["banned"]).inc();
                let mut res = Response::new(Body::from("address is temporarily banned"));
                *res.status_mut() = StatusCode::FORBIDDEN;
                return Ok(res);
            }
            if let Some(max) = settings.limits.max_connections {
                if active_connections.load(Ordering::SeqCst) >= max {
                    metrics.connections_refused.with_label_values(&["max_connections"]).inc();
                    let mut res = Response::new(Body::from("too many connections"));
                    *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                    return Ok(res);
                }
            }
            ban_table.on_connect(&remote_ip, now);
            active_connections.fetch_add(1, Ordering::SeqCst);

            let response = match handshake::server::create_response_with_body(&request, Body::empty) {
                Ok(response) => {
                    tokio::spawn(async move {
                        match upgrade::on(&mut request).await {
                            Ok(upgraded) => {
                                let config = WebSocketConfig {
                                    max_send_queue: Some(1024),
                                    max_message_size: Some(settings.limits.max_frame_bytes()),
                                    max_frame_size: Some(settings.limits.max_frame_bytes()),
                                    ..Default::default()
                                };
                                let ws_stream = WebSocketStream::from_raw_socket(
                                    upgraded,
                                    tokio_tungstenite::tungstenite::protocol::Role::Server,
                                    Some(config),
                                )
                                .await;
                                let client_info = ClientInfo {
                                    remote_ip,
                                    user_agent,
                                    origin,
                                };
                                nostr_server(
                                    repo,
                                    client_info,
                                    settings,
                                    ws_stream,
                                    dispatcher,
                                    ban_table,
                                    shutdown,
                                    metrics,
                                )
                                .await;
                                active_connections.fetch_sub(1, Ordering::SeqCst);
                            }
                            Err(e) => {
                                active_connections.fetch_sub(1, Ordering::SeqCst);
                                warn!("websocket upgrade failed from {}: {}", remote_addr, e);
                            }
                        }
                    });
                    response
                }
                Err(e) => {
                    active_connections.fetch_sub(1, Ordering::SeqCst);
                    warn!("websocket handshake response failed: {}", e);
                    let mut res = Response::new(Body::from(format!("failed to create websocket: {e}")));
                    *res.status_mut() = StatusCode::BAD_REQUEST;
                    return Ok(res);
                }
            };
            Ok::<_, Infallible>(response)
        }
        ("/", false) => {
            let accept_header = request.headers().get(ACCEPT);
            if let Some(media_types) = accept_header {
                if let Ok(mt_str) = media_types.to_str() {
                    if mt_str.contains(crate::info::NIP11_CONTENT_TYPE) {
                        debug!("responding to server info request");
                        return Ok(Response::builder()
                            .status(200)
                            .header("Content-Type", crate::info::NIP11_CONTENT_TYPE)
                            .header("Access-Control-Allow-Origin", "*")
                            .body(Body::from(relay_info.to_json()))
                            .unwrap());
                    }
                }
            }
            Ok(Response::builder()
                .status(200)
                .header("Content-Type", "text/plain")
                .body(Body::from("Please use a Nostr client to connect."))
                .unwrap())
        }
        ("/metrics", false) => {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            encoder.encode(&registry.gather(), &mut buffer).unwrap();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(Body::from(buffer))
                .unwrap())
        }
        (_, _) => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Nothing here."))
            .unwrap()),
    }
}

/// Returns on SIGINT, SIGTERM, or an internally-requested shutdown signal.
async fn ctrl_c_or_signal(mut shutdown_signal: Receiver<()>) {
    let mut term_signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("could not register SIGTERM handler");
    tokio::select! {
        _ = shutdown_signal.recv() => {
            info!("shutting down web server as requested");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down web server due to SIGINT");
        },
        _ = term_signal.recv() => {
            info!("shutting down web server due to SIGTERM");
        },
    }
}

/// Start running a Nostr relay server. The storage backend is supplied by
/// the caller (process bootstrap), which is the external collaborator that
/// knows how to stand up the concrete SQL engine (spec.md §1 Non-goals).
pub fn start_server(
    settings: &Settings,
    repo: Arc<dyn NostrRepo>,
    shutdown_rx: StdReceiver<()>,
) -> Result<()> {
    trace!("config: {:?}", settings);
    let addr = format!(
        "{}:{}",
        settings.network.address.trim(),
        settings.network.port
    );
    let socket_addr = addr.parse().expect("listening address not valid");
    if let Some(wl) = &settings.authorization.pubkey_whitelist {
        info!("event publishing restricted to {} pubkey(s)", wl.len());
    }

    let rt = Builder::new_multi_thread()
        .enable_all()
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("tokio-ws-{id}")
        })
        .max_blocking_threads(settings.limits.max_blocking_threads)
        .build()
        .map_err(|e| Error::CustomError(e.to_string()))?;

    rt.block_on(async {
        let settings = settings.clone();
        info!("listening on: {}", socket_addr);

        let (registry, metrics) = create_metrics();
        let dispatcher = Arc::new(Dispatcher::new());
        let ban_table = Arc::new(BanTable::new(settings.throttling.clone()));
        let active_connections = Arc::new(AtomicUsize::new(0));
        let identity_path = crate::identity::default_identity_path(std::path::Path::new(
            &settings.database.data_directory,
        ));
        let identity = RelayIdentity::load_or_generate(&identity_path)?;
        let relay_info = RelayInfo::from_settings(&settings, &identity.public_key_hex());

        let (invoke_shutdown, shutdown_listen) = broadcast::channel::<()>(1);

        // Cross-node change-feed consumer: every durably-persisted event
        // (local or from another node) is republished through the
        // dispatcher, which fans it out to this node's live subscriptions
        // (spec.md §4.5).
        {
            let mut changes = repo.subscribe_changes();
            let dispatcher = dispatcher.clone();
            let mut shutdown = invoke_shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        event = changes.recv() => match event {
                            Ok(event) => dispatcher.publish(&event),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("change feed consumer lagged, dropped {} events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        ban::spawn_sweeper(ban_table.clone());

        {
            let repo = repo.clone();
            let mut shutdown = invoke_shutdown.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(EXPIRATION_SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = interval.tick() => {
                            let now = chrono::Utc::now().timestamp();
                            match repo.sweep_expired(now).await {
                                Ok(n) if n > 0 => debug!("expiration sweep removed {} event(s)", n),
                                Ok(_) => {}
                                Err(e) => warn!("expiration sweep failed: {:?}", e),
                            }
                        },
                    }
                }
            });
        }

        {
            let invoke_shutdown = invoke_shutdown.clone();
            // `shutdown_rx` is a std (blocking) receiver fed from outside the
            // runtime (e.g. a ctrlc handler on the main thread); block a
            // dedicated pool thread on it rather than an async task.
            tokio::task::spawn_blocking(move || match shutdown_rx.recv() {
                Ok(()) => {
                    info!("control message requesting shutdown");
                    invoke_shutdown.send(()).ok();
                }
                Err(std::sync::mpsc::RecvError) => {
                    trace!("shutdown requestor disconnected (this is normal)");
                }
            });
        }

        let make_svc = make_service_fn(|conn: &AddrStream| {
            let repo = repo.clone();
            let remote_addr = conn.remote_addr();
            let dispatcher = dispatcher.clone();
            let ban_table = ban_table.clone();
            let active_connections = active_connections.clone();
            let relay_info = relay_info.clone();
            let settings = settings.clone();
            let registry = registry.clone();
            let metrics = metrics.clone();
            let shutdown_listen = shutdown_listen.resubscribe();
            async move {
                Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                    handle_web_request(
                        request,
                        repo.clone(),
                        settings.clone(),
                        remote_addr,
                        dispatcher.clone(),
                        ban_table.clone(),
                        active_connections.clone(),
                        relay_info.clone(),
                        shutdown_listen.resubscribe(),
                        registry.clone(),
                        metrics.clone(),
                    )
                }))
            }
        });
        let server = Server::bind(&socket_addr)
            .serve(make_svc)
            .with_graceful_shutdown(ctrl_c_or_signal(shutdown_listen.resubscribe()));
        if let Err(e) = server.await {
            error!("server error: {e}");
        }
        Ok(())
    })
}

/// Nostr protocol messages from a client. Matches the four verbs from
/// spec.md §4.2; `#[serde(untagged)]` tries each variant's hand-rolled
/// `Deserialize` in declaration order.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
#[serde(untagged)]
pub enum NostrMessage {
    EventMsg(EventCmd),
    SubMsg(Subscription),
    CloseMsg(CloseCmd),
    CountMsg(CountCmd),
}

impl<'de> Deserialize<'de> for NostrMessage {
    fn deserialize<D>(deserializer: D) -> std::result::Result<NostrMessage, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // `#[serde(untagged)]` on a derived enum buffers the input and
        // tries each variant; hand-rolling it here lets every member keep
        // its own tag-checking Visitor (see `EventCmd`'s doc comment).
        let value: serde_json::Value = serde::Deserialize::deserialize(deserializer)?;
        if let Ok(v) = serde_json::from_value::<EventCmd>(value.clone()) {
            return Ok(NostrMessage::EventMsg(v));
        }
        if let Ok(v) = serde_json::from_value::<Subscription>(value.clone()) {
            return Ok(NostrMessage::SubMsg(v));
        }
        if let Ok(v) = serde_json::from_value::<CloseCmd>(value.clone()) {
            return Ok(NostrMessage::CloseMsg(v));
        }
        if let Ok(v) = serde_json::from_value::<CountCmd>(value) {
            return Ok(NostrMessage::CountMsg(v));
        }
        Err(serde::de::Error::custom("unrecognized command"))
    }
}

/// Parse a raw text frame into a `NostrMessage`, enforcing the configured
/// max event size only for `EVENT` frames.
fn convert_to_msg(msg: &str, max_bytes: Option<usize>) -> Result<NostrMessage> {
    match serde_json::from_str::<NostrMessage>(msg) {
        Ok(m) => {
            if let NostrMessage::EventMsg(_) = m {
                if let Some(max_size) = max_bytes {
                    if max_size > 0 && msg.len() > max_size {
                        return Err(Error::EventMaxLengthError(msg.len()));
                    }
                }
            }
            Ok(m)
        }
        Err(e) => {
            trace!("proto parse error: {:?} (message: {:?})", e, msg.trim());
            Err(Error::ProtoParseError)
        }
    }
}

fn make_notice_message(notice: &Notice) -> Message {
    Message::Text(notice.to_json().to_string())
}

struct ClientInfo {
    remote_ip: String,
    user_agent: Option<String>,
    origin: Option<String>,
}

/// A result destined for one client's query-result channel: either a
/// single matching stored event, or the end-of-stored-events marker.
enum QueryResult {
    Event { sub_id: String, event: Box<Event> },
    Eose { sub_id: String },
}

/// Runs one subscription's historical query to completion against
/// storage (spec.md §4.4 `query`), then emits `EOSE`. Spawned so the
/// connection's main select loop is never blocked on a storage round
/// trip (the teacher's `db_writer`/`query_subscription` split serves the
/// same purpose).
fn spawn_subscription_query(
    repo: Arc<dyn NostrRepo>,
    sub: Subscription,
    max_limit: usize,
    query_tx: mpsc::Sender<QueryResult>,
    mut abandon_rx: oneshot::Receiver<()>,
    metrics: NostrMetrics,
) {
    tokio::spawn(async move {
        let sub_started = Instant::now();
        let mut seen = std::collections::HashSet::new();
        let mut combined: Vec<Event> = Vec::new();
        for filter in &sub.filters {
            if abandon_rx.try_recv().is_ok() {
                metrics.query_aborts.with_label_values(&["closed"]).inc();
                return;
            }
            let limit = filter.clamped_limit(max_limit);
            let query_started = Instant::now();
            let result = repo.query(filter, limit).await;
            metrics.query_db.observe(query_started.elapsed().as_secs_f64());
            match result {
                Ok(events) => {
                    for event in events {
                        if seen.insert(event.id.clone()) {
                            combined.push(event);
                        }
                    }
                }
                Err(e) => {
                    warn!("query error for sub {}: {:?}", sub.id, e);
                }
            }
        }
        combined.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        for event in combined {
            if abandon_rx.try_recv().is_ok() {
                metrics.query_aborts.with_label_values(&["closed"]).inc();
                return;
            }
            if query_tx
                .send(QueryResult::Event {
                    sub_id: sub.id.clone(),
                    event: Box::new(event),
                })
                .await
                .is_err()
            {
                metrics.query_aborts.with_label_values(&["connection_closed"]).inc();
                return;
            }
        }
        metrics.query_sub.observe(sub_started.elapsed().as_secs_f64());
        query_tx.send(QueryResult::Eose { sub_id: sub.id }).await.ok();
    });
}

/// Handle one client connection through its full lifecycle: framing,
/// command dispatch, rate limiting, and cleanup (spec.md §4.1–§4.6).
#[allow(clippy::too_many_arguments)]
async fn nostr_server(
    repo: Arc<dyn NostrRepo>,
    client_info: ClientInfo,
    settings: Settings,
    mut ws_stream: WebSocketStream<Upgraded>,
    dispatcher: Arc<Dispatcher>,
    ban_table: Arc<BanTable>,
    mut shutdown: Receiver<()>,
    metrics: NostrMetrics,
) {
    let orig_start = Instant::now();
    let (client_id, mut bcast_rx) = dispatcher.add_client();
    let mut conn = ClientConn::with_max_subscriptions(
        client_info.remote_ip,
        settings.limits.max_subscriptions_per_connection,
    );
    let cid = conn.get_client_prefix();

    let event_limiter = ConnLimiter::new(
        Some(settings.rate_limit.max_events_per_second),
        Some(settings.rate_limit.burst_size),
    );
    let sub_limiter = ConnLimiter::per_minute(settings.limits.subscriptions_per_min);

    let (query_tx, mut query_rx) = mpsc::channel::<QueryResult>(2_048);
    let (notice_tx, mut notice_rx) = mpsc::channel::<Notice>(128);
    let mut running_queries: HashMap<String, oneshot::Sender<()>> = HashMap::new();

    let mut last_message_time = Instant::now();
    let ping_dur = Duration::from_secs(settings.network.ping_interval_seconds.into());
    let mut ping_interval = tokio::time::interval_at(tokio::time::Instant::now() + ping_dur, ping_dur);
    let write_timeout = Duration::from_secs(settings.network.write_timeout_seconds);

    let mut client_published_event_count: usize = 0;
    let mut client_received_event_count: usize = 0;

    info!("new connection (cid: {}, ip: {})", cid, conn.ip());
    info!(
        "cid: {}, origin: {:?}, user-agent: {:?}",
        cid, client_info.origin, client_info.user_agent
    );
    metrics.connections.inc();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                metrics.disconnects.with_label_values(&["shutdown"]).inc();
                info!("closing connection due to shutdown (cid: {}, connected: {:?})", cid, orig_start.elapsed());
                break;
            },
            _ = ping_interval.tick() => {
                if orig_start.elapsed() > MAX_CONNECTION_LIFETIME {
                    debug!("closing connection past max lifetime (cid: {})", cid);
                    metrics.disconnects.with_label_values(&["max_lifetime"]).inc();
                    break;
                }
                if last_message_time.elapsed() > PONG_TIMEOUT {
                    debug!("closing connection, no pong (cid: {})", cid);
                    metrics.disconnects.with_label_values(&["timeout"]).inc();
                    break;
                }
                if last_message_time.elapsed() > settings.limits.idle_timeout() {
                    debug!("closing idle connection (cid: {})", cid);
                    metrics.disconnects.with_label_values(&["idle"]).inc();
                    break;
                }
                let _ = tokio::time::timeout(write_timeout, ws_stream.send(Message::Ping(Vec::new()))).await;
            },
            Some(notice_msg) = notice_rx.recv() => {
                let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&notice_msg))).await;
            },
            Some(query_result) = query_rx.recv() => {
                match query_result {
                    QueryResult::Eose { sub_id } => {
                        let escaped = sub_id.replace('"', "");
                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(Message::Text(format!("[\"EOSE\",\"{escaped}\"]")))).await;
                    }
                    QueryResult::Event { sub_id, event } => {
                        client_received_event_count += 1;
                        metrics.sent_events.with_label_values(&["stored"]).inc();
                        if let Ok(event_json) = serde_json::to_string(&event) {
                            let escaped = sub_id.replace('"', "");
                            let _ = tokio::time::timeout(write_timeout, ws_stream.send(Message::Text(format!("[\"EVENT\",\"{escaped}\",{event_json}]")))).await;
                        }
                    }
                }
            },
            Some(event) = bcast_rx.recv() => {
                for sub_id in conn.matching_subscriptions(&event) {
                    if let Ok(event_json) = serde_json::to_string(&event) {
                        let escaped = sub_id.replace('"', "");
                        metrics.sent_events.with_label_values(&["realtime"]).inc();
                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(Message::Text(format!("[\"EVENT\",\"{escaped}\",{event_json}]")))).await;
                    }
                }
            },
            ws_next = ws_stream.next() => {
                last_message_time = Instant::now();
                let nostr_msg = match ws_next {
                    Some(Ok(Message::Text(m))) => convert_to_msg(&m, settings.limits.max_event_bytes),
                    Some(Ok(Message::Binary(_))) => {
                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::message("binary messages are not accepted".into())))).await;
                        continue;
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Err(WsError::Capacity(MessageTooLong { size, max_size }))) => {
                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::message(format!("message too large ({size} > {max_size})"))))).await;
                        continue;
                    },
                    None
                    | Some(Ok(Message::Close(_))
                        | Err(WsError::AlreadyClosed
                            | WsError::ConnectionClosed
                            | WsError::Protocol(tungstenite::error::ProtocolError::ResetWithoutClosingHandshake))) => {
                        debug!("websocket close from client (cid: {}, ip: {})", cid, conn.ip());
                        metrics.disconnects.with_label_values(&["normal"]).inc();
                        break;
                    },
                    Some(Err(WsError::Io(e))) => {
                        warn!("IO error (cid: {}, ip: {}): {:?}", cid, conn.ip(), e);
                        metrics.disconnects.with_label_values(&["error"]).inc();
                        break;
                    },
                    x => {
                        info!("unhandled websocket condition (cid: {}): {:?} (closing)", cid, x);
                        metrics.disconnects.with_label_values(&["error"]).inc();
                        break;
                    }
                };

                match nostr_msg {
                    Ok(NostrMessage::EventMsg(ec)) => {
                        metrics.cmd_event.inc();
                        let evid = ec.event_id();
                        if !event_limiter.check() {
                            let address = conn.ip().to_owned();
                            let author = ec.event.get("pubkey").and_then(serde_json::Value::as_str).unwrap_or("unknown");
                            metrics.spams.with_label_values(&[author]).inc();
                            let just_banned = ban_table.record_violation(&address, SystemTime::now());
                            let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::message("rate-limited".into())))).await;
                            if just_banned {
                                metrics.bans_total.inc();
                                info!("banning {} for excessive EVENT rate (cid: {})", address, cid);
                                break;
                            }
                            continue;
                        }
                        match Event::try_from(ec) {
                            Ok(event) => {
                                client_published_event_count += 1;
                                let repo = repo.clone();
                                let settings = settings.clone();
                                let notice_tx = notice_tx.clone();
                                let metrics = metrics.clone();
                                tokio::spawn(async move {
                                    handle_event(event, evid, repo, settings, notice_tx, metrics).await;
                                });
                            }
                            Err(e) => {
                                info!("client sent an invalid event (cid: {})", cid);
                                let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::invalid(evid, &e.to_string())))).await;
                            }
                        }
                    },
                    Ok(NostrMessage::SubMsg(s)) => {
                        debug!("subscription requested (cid: {}, sub: {})", cid, s.id);
                        let sub_id = s.id.clone();
                        match s.validate() {
                            Err(e) => {
                                let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::closed(sub_id, &e.to_string())))).await;
                            }
                            Ok(s) if conn.has_subscription(&s) => {
                                info!("duplicate subscription ignored (cid: {}, sub: {})", cid, s.id);
                            }
                            Ok(s) if s.filters.len() > settings.limits.max_filters_per_subscription => {
                                let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::closed(sub_id, "too many filters in subscription")))).await;
                            }
                            Ok(s) => {
                                metrics.cmd_req.inc();
                                sub_limiter.until_ready().await;
                                let (abandon_tx, abandon_rx) = oneshot::channel::<()>();
                                match conn.subscribe(s.clone()) {
                                    Ok(()) => {
                                        if let Some(previous) = running_queries.insert(s.id.clone(), abandon_tx) {
                                            previous.send(()).ok();
                                        }
                                        spawn_subscription_query(repo.clone(), s, settings.limits.max_limit, query_tx.clone(), abandon_rx, metrics.clone());
                                    }
                                    Err(e) => {
                                        info!("subscription error: {} (cid: {}, sub: {})", e, cid, s.id);
                                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::closed(s.id.clone(), &e.to_string())))).await;
                                    }
                                }
                            }
                        }
                    },
                    Ok(NostrMessage::CloseMsg(cc)) => {
                        match Close::try_from(cc) {
                            Ok(c) => {
                                metrics.cmd_close.inc();
                                if let Some(tx) = running_queries.remove(&c.id) {
                                    tx.send(()).ok();
                                }
                                conn.unsubscribe(&c);
                            }
                            Err(_) => {
                                let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::message("could not parse CLOSE command".into())))).await;
                            }
                        }
                    },
                    Ok(NostrMessage::CountMsg(cmd)) => {
                        match cmd.validate() {
                            Ok(cmd) => {
                                metrics.cmd_count.inc();
                                match repo.count(&cmd.filters).await {
                                    Ok(count) => {
                                        let notice = Notice::Count(crate::notice::CountResult { sub_id: cmd.id, count });
                                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&notice))).await;
                                    }
                                    Err(e) => {
                                        warn!("count query failed (cid: {}): {:?}", cid, e);
                                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::message(format!("count error: {e}"))))).await;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::message(format!("invalid COUNT: {e}"))))).await;
                            }
                        }
                    },
                    Err(Error::EventMaxLengthError(n)) => {
                        info!("client sent a command larger ({} bytes) than the max size (cid: {})", n, cid);
                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::message("event exceeded max size".into())))).await;
                    },
                    Err(Error::ProtoParseError) => {
                        info!("client sent an unparseable command (cid: {})", cid);
                        let _ = tokio::time::timeout(write_timeout, ws_stream.send(make_notice_message(&Notice::message("could not parse command".into())))).await;
                    },
                    Err(e) => {
                        info!("non-fatal error from client (cid: {}): {:?}", cid, e);
                    },
                }
            },
        }
    }

    for (_, stop_tx) in running_queries {
        stop_tx.send(()).ok();
    }
    dispatcher.remove_client(&client_id);
    info!(
        "closing connection (cid: {}, ip: {}, sent: {} events, recv: {} events, connected: {:?})",
        cid,
        conn.ip(),
        client_published_event_count,
        client_received_event_count,
        orig_start.elapsed(),
    );
}

/// Runs the validator and, on success, persists the event, replying on
/// `notice_tx`. Spawned per `EVENT` so a slow dedupe probe or storage
/// round trip never blocks the connection's select loop.
async fn handle_event(
    mut event: Event,
    evid: String,
    repo: Arc<dyn NostrRepo>,
    settings: Settings,
    notice_tx: mpsc::Sender<Notice>,
    metrics: NostrMetrics,
) {
    let now = chrono::Utc::now().timestamp();
    match validator::validate(&mut event, repo.as_ref(), &settings, now).await {
        Ok(validator::Outcome::Duplicate) => {
            notice_tx.send(Notice::duplicate(evid)).await.ok();
        }
        Ok(validator::Outcome::Accepted) => {
            let write_started = Instant::now();
            let put_result = repo.put(event).await;
            metrics.write_events.observe(write_started.elapsed().as_secs_f64());
            match put_result {
                Ok(outcome) if outcome.duplicate => {
                    notice_tx.send(Notice::duplicate(evid)).await.ok();
                }
                Ok(_) => {
                    notice_tx.send(Notice::saved(evid)).await.ok();
                }
                Err(e) => {
                    warn!("storage error persisting event {}: {:?}", evid, e);
                    notice_tx.send(Notice::storage_error(evid, &e.to_string())).await.ok();
                }
            }
        }
        Err(Error::Invalid(msg)) => {
            notice_tx.send(Notice::invalid(evid, &msg)).await.ok();
        }
        Err(Error::Blocked(msg)) => {
            notice_tx.send(Notice::blocked(evid, &msg)).await.ok();
        }
        Err(Error::Unauthorized(msg)) => {
            notice_tx.send(Notice::unauthorized(evid, &msg)).await.ok();
        }
        Err(Error::Expired) => {
            notice_tx.send(Notice::invalid(evid, "event has expired")).await.ok();
        }
        Err(e) => {
            notice_tx.send(Notice::invalid(evid, &e.to_string())).await.ok();
        }
    }
}
