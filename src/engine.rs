use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tracing::{debug, info, warn};

use crate::cache::SharedCache;
use crate::config::ProxyConfig;
use crate::key::normalize_qname;
use crate::plugin::{
    CacheReader, CacheWriter, PluginsAction, PluginsState, RecordOutcome, query_name,
};
use crate::proto_utils::{restore_qname_case, truncated_reply};
use crate::upstream;

#[derive(Clone)]
pub struct Engine {
    config: Arc<ArcSwap<ProxyConfig>>,
    cache: &'static SharedCache,
    // Runtime counters / 运行时计数
    pub metrics_total_requests: Arc<AtomicU64>,
    pub metrics_cache_hits: Arc<AtomicU64>,
    pub metrics_stale_served: Arc<AtomicU64>,
    pub metrics_upstream_failures: Arc<AtomicU64>,
}

impl Engine {
    pub fn new(config: Arc<ArcSwap<ProxyConfig>>, cache: &'static SharedCache) -> Self {
        Self {
            config,
            cache,
            metrics_total_requests: Arc::new(AtomicU64::new(0)),
            metrics_cache_hits: Arc::new(AtomicU64::new(0)),
            metrics_stale_served: Arc::new(AtomicU64::new(0)),
            metrics_upstream_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn metrics_snapshot(&self) -> String {
        format!(
            "total={} cache_hits={} stale_served={} upstream_failures={} cache={:?}",
            self.metrics_total_requests.load(Ordering::Relaxed),
            self.metrics_cache_hits.load(Ordering::Relaxed),
            self.metrics_stale_served.load(Ordering::Relaxed),
            self.metrics_upstream_failures.load(Ordering::Relaxed),
            self.cache.state(),
        )
    }

    /// 处理一个请求包，返回应答字节 / Handle one query packet and return the encoded answer.
    pub async fn handle_packet(
        &self,
        packet: &[u8],
        peer: SocketAddr,
        transport: Transport,
    ) -> anyhow::Result<Bytes> {
        self.metrics_total_requests.fetch_add(1, Ordering::Relaxed);
        let cfg = self.config.load_full();
        let req = Message::from_bytes(packet).context("parse request")?;
        let reply = |msg: &Message| encode_reply(msg, &req, packet, transport);
        if req.queries().is_empty() {
            return reply(&error_response(&req, ResponseCode::FormErr));
        }

        let start = Instant::now();
        let qname = query_name(&req);
        let mut state = PluginsState::new(cfg.cache.clone(), &req);
        let use_cache = cfg.cache.enabled;

        if use_cache {
            CacheReader::new(self.cache).eval(&mut state, &req, start);
        }
        if state.action == PluginsAction::Synth {
            if let Some(synth) = state.synth_response.take() {
                self.metrics_cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event = "dns_response",
                    qname = %qname,
                    rcode = ?synth.response_code(),
                    client_ip = %peer.ip(),
                    latency_us = start.elapsed().as_micros() as u64,
                    cache = true,
                    "cache hit"
                );
                return reply(&synth);
            }
        }

        let upstream = cfg.upstream_addr()?;
        let raw = match upstream::forward(packet, upstream, cfg.upstream_timeout()).await {
            Ok(raw) => raw,
            Err(err) => {
                let fallback = self.upstream_failed(&mut state, &req, &qname, peer, &err);
                return reply(&fallback);
            }
        };

        let mut resp = match Message::from_bytes(&raw) {
            Ok(resp) => resp,
            Err(err) => {
                debug!(upstream = %upstream, error = %err, "unparsable upstream answer passed through");
                return Ok(raw);
            }
        };

        if !same_question(&req, &resp) {
            let err = anyhow::anyhow!("upstream answer question does not match the query");
            let fallback = self.upstream_failed(&mut state, &req, &qname, peer, &err);
            return reply(&fallback);
        }

        if use_cache {
            match CacheWriter::new(self.cache).eval(&state, &mut resp, Instant::now()) {
                Ok(RecordOutcome::Cached { ttl }) => {
                    debug!(target = "cache", qname = %qname, ttl_secs = ttl.as_secs(), "answer cached");
                }
                Ok(RecordOutcome::Skipped(reason)) => {
                    debug!(target = "cache", qname = %qname, reason = ?reason, "answer not cached");
                }
                Err(err) => {
                    warn!(target = "cache", qname = %qname, error = %err, "failed to initialize the cache");
                }
            }
        }

        debug!(
            event = "dns_response",
            upstream = %upstream,
            qname = %qname,
            rcode = ?resp.response_code(),
            client_ip = %peer.ip(),
            latency_us = start.elapsed().as_micros() as u64,
            cache = false,
            "upstream answer"
        );
        reply(&resp)
    }

    /// Stale candidate if the reader kept one, SERVFAIL otherwise.
    fn upstream_failed(
        &self,
        state: &mut PluginsState,
        req: &Message,
        qname: &str,
        peer: SocketAddr,
        err: &anyhow::Error,
    ) -> Message {
        self.metrics_upstream_failures.fetch_add(1, Ordering::Relaxed);
        match state.stale.take() {
            Some(stale) => {
                self.metrics_stale_served.fetch_add(1, Ordering::Relaxed);
                info!(
                    event = "stale_served",
                    qname = %qname,
                    client_ip = %peer.ip(),
                    error = %err,
                    "upstream failed, serving stale answer"
                );
                stale
            }
            None => {
                warn!(qname = %qname, client_ip = %peer.ip(), error = %err, "upstream failed");
                error_response(req, ResponseCode::ServFail)
            }
        }
    }
}

/// 客户端到达的传输方式 / Transport the query arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Largest UDP reply the client accepts: 512 without EDNS.
#[inline]
fn udp_payload_limit(req: &Message) -> usize {
    req.extensions()
        .as_ref()
        .map_or(512, |edns| edns.max_payload().max(512)) as usize
}

/// First questions must agree on name (ignoring case), type and class.
fn same_question(req: &Message, resp: &Message) -> bool {
    match (req.queries().first(), resp.queries().first()) {
        (Some(q), Some(r)) => {
            q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
                && normalize_qname(q.name()) == normalize_qname(r.name())
        }
        _ => false,
    }
}

fn error_response(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().to_vec());
    msg
}

/// Encode `msg` as the reply to `packet`: the client's question spelling is
/// restored, and oversized UDP replies shrink to a TC header plus question.
fn encode_reply(
    msg: &Message,
    req: &Message,
    packet: &[u8],
    transport: Transport,
) -> anyhow::Result<Bytes> {
    let mut out = msg.to_bytes().context("encode response")?;
    restore_qname_case(&mut out, packet);

    let limit = udp_payload_limit(req);
    if transport == Transport::Udp && out.len() > limit {
        if let Some(tc) = truncated_reply(&out) {
            debug!(size = out.len(), limit, "reply exceeds client udp size, sending truncated");
            return Ok(Bytes::from(tc));
        }
    }
    Ok(Bytes::from(out))
}
