//! Per-connection state: the subscription table, identity-address, and
//! the real-IP resolution helper used at accept time (spec.md §4.1, §3).
use crate::close::Close;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::subscription::Subscription;
use http::HeaderMap;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Tracks one connection's live subscriptions, exclusively owned by that
/// connection's task.
pub struct ClientConn {
    remote_ip: String,
    subscriptions: HashMap<String, Subscription>,
    max_subscriptions: usize,
}

impl ClientConn {
    #[must_use]
    pub fn new(remote_ip: String) -> ClientConn {
        ClientConn {
            remote_ip,
            subscriptions: HashMap::new(),
            max_subscriptions: 32,
        }
    }

    #[must_use]
    pub fn with_max_subscriptions(remote_ip: String, max_subscriptions: usize) -> ClientConn {
        ClientConn {
            remote_ip,
            subscriptions: HashMap::new(),
            max_subscriptions,
        }
    }

    #[must_use]
    pub fn ip(&self) -> &str {
        &self.remote_ip
    }

    /// Short connection id used in logs.
    #[must_use]
    pub fn get_client_prefix(&self) -> String {
        self.remote_ip.chars().take(16).collect()
    }

    #[must_use]
    pub fn has_subscription(&self, sub: &Subscription) -> bool {
        self.subscriptions.get(&sub.id).is_some_and(|s| s == sub)
    }

    pub fn subscribe(&mut self, sub: Subscription) -> Result<()> {
        if self.subscriptions.len() >= self.max_subscriptions && !self.subscriptions.contains_key(&sub.id) {
            return Err(Error::SubscriptionLimitExceeded);
        }
        self.subscriptions.insert(sub.id.clone(), sub);
        Ok(())
    }

    pub fn unsubscribe(&mut self, close: &Close) {
        self.subscriptions.remove(&close.id);
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (&String, &Subscription)> {
        self.subscriptions.iter()
    }

    /// All subscription ids whose filters match `event`.
    pub fn matching_subscriptions<'a>(&'a self, event: &'a Event) -> impl Iterator<Item = &'a str> {
        self.subscriptions
            .values()
            .filter(move |s| s.interested_in_event(event))
            .map(|s| s.id.as_str())
    }
}

/// Resolve the real client address: the first syntactically valid address
/// in the configured header (`X-Real-IP` preferred, else the first entry
/// of `X-Forwarded-For`), falling back to the socket peer address.
/// IPv4-mapped IPv6 addresses are canonicalized to IPv4.
#[must_use]
pub fn resolve_remote_ip(headers: &HeaderMap, peer: SocketAddr, remote_ip_header: Option<&str>) -> String {
    if let Some(header_name) = remote_ip_header {
        if let Some(value) = get_header_string(header_name, headers) {
            if let Some(addr) = value.trim().parse::<IpAddr>().ok() {
                return canonicalize(addr).to_string();
            }
        }
    }
    if let Some(value) = get_header_string("x-forwarded-for", headers) {
        if let Some(first) = value.split(',').next() {
            if let Ok(addr) = first.trim().parse::<IpAddr>() {
                return canonicalize(addr).to_string();
            }
        }
    }
    canonicalize(peer.ip()).to_string()
}

fn canonicalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        other => other,
    }
}

fn get_header_string(header: &str, headers: &HeaderMap) -> Option<String> {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use http::HeaderValue;

    #[test]
    fn prefers_real_ip_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.5"));
        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        let ip = resolve_remote_ip(&headers, peer, Some("x-real-ip"));
        assert_eq!(ip, "203.0.113.5");
    }

    #[test]
    fn falls_back_to_forwarded_for_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.9, 10.0.0.2"),
        );
        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        let ip = resolve_remote_ip(&headers, peer, Some("x-real-ip"));
        assert_eq!(ip, "198.51.100.9");
    }

    #[test]
    fn falls_back_to_socket_peer() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "198.51.100.9:9999".parse().unwrap();
        let ip = resolve_remote_ip(&headers, peer, None);
        assert_eq!(ip, "198.51.100.9");
    }

    #[test]
    fn subscription_limit_enforced() {
        let mut conn = ClientConn::with_max_subscriptions("1.2.3.4".into(), 1);
        let sub1 = Subscription::new("a".into(), vec![Filter::default()]).unwrap();
        let sub2 = Subscription::new("b".into(), vec![Filter::default()]).unwrap();
        assert!(conn.subscribe(sub1).is_ok());
        assert!(conn.subscribe(sub2).is_err());
    }

    #[test]
    fn resubscribing_same_id_does_not_count_twice() {
        let mut conn = ClientConn::with_max_subscriptions("1.2.3.4".into(), 1);
        let sub1 = Subscription::new("a".into(), vec![Filter::default()]).unwrap();
        let sub1b = Subscription::new("a".into(), vec![Filter::default()]).unwrap();
        assert!(conn.subscribe(sub1).is_ok());
        assert!(conn.subscribe(sub1b).is_ok());
        assert_eq!(conn.subscription_count(), 1);
    }
}
