use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use tracing::debug;

use crate::cache::{CachedEntry, STALE_RESPONSE_TTL, SharedCache};
use crate::config::CacheSettings;
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::ttl::{TtlBounds, response_ttl, update_ttl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginsAction {
    /// 继续转发上游 / keep going to upstream.
    Forward,
    /// 使用 `synth_response` 直接应答 / answer with `synth_response`.
    Synth,
}

/// Per-query state shared by the reader and the writer of one query.
#[derive(Debug, Clone)]
pub struct PluginsState {
    pub dnssec: bool,
    pub settings: CacheSettings,
    pub action: PluginsAction,
    pub synth_response: Option<Message>,
    /// Expired answer kept as a fallback if upstream fails.
    pub stale: Option<Message>,
    pub cache_hit: bool,
}

impl PluginsState {
    pub fn new(settings: CacheSettings, query: &Message) -> Self {
        Self {
            dnssec: query
                .extensions()
                .as_ref()
                .is_some_and(|edns| edns.dnssec_ok()),
            settings,
            action: PluginsAction::Forward,
            synth_response: None,
            stale: None,
            cache_hit: false,
        }
    }

    #[inline]
    pub fn ttl_bounds(&self) -> TtlBounds {
        TtlBounds::from_secs(
            self.settings.min_ttl,
            self.settings.max_ttl,
            self.settings.neg_min_ttl,
            self.settings.neg_max_ttl,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Fresh,
    Stale,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Uncacheable(ResponseCode),
    Truncated,
    NoQuestion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Cached { ttl: Duration },
    Skipped(SkipReason),
}

/// Query-side stage: replays cached answers.
#[derive(Clone, Copy)]
pub struct CacheReader<'a> {
    cache: &'a SharedCache,
}

impl<'a> CacheReader<'a> {
    pub fn new(cache: &'a SharedCache) -> Self {
        Self { cache }
    }

    pub fn eval(&self, state: &mut PluginsState, query: &Message, now: Instant) -> LookupOutcome {
        let Some(key) = CacheKey::for_message(query, state.dnssec) else {
            return LookupOutcome::Miss;
        };
        let Some(store) = self.cache.get() else {
            return LookupOutcome::Miss;
        };
        let Some(cached) = store.get(&key) else {
            return LookupOutcome::Miss;
        };

        let mut synth = synthesize(&cached, query);

        if !cached.is_fresh(now) {
            update_ttl(&mut synth, now + STALE_RESPONSE_TTL, now);
            state.stale = Some(synth);
            debug!(target = "cache", qname = %query_name(query), "stale candidate kept");
            return LookupOutcome::Stale;
        }

        update_ttl(&mut synth, cached.expiration, now);
        state.synth_response = Some(synth);
        state.action = PluginsAction::Synth;
        state.cache_hit = true;
        LookupOutcome::Fresh
    }
}

/// Private copy of the cached answer dressed up as a reply to `query`.
fn synthesize(cached: &CachedEntry, query: &Message) -> Message {
    let mut synth = Message::clone(&cached.message);
    synth.set_id(query.id());
    synth.set_message_type(MessageType::Response);
    // names are always compressed by the hickory encoder
    synth.take_queries();
    let queries: Vec<Query> = query.queries().to_vec();
    synth.add_queries(queries);
    synth
}

/// Response-side stage: stores upstream answers.
#[derive(Clone, Copy)]
pub struct CacheWriter<'a> {
    cache: &'a SharedCache,
}

impl<'a> CacheWriter<'a> {
    pub fn new(cache: &'a SharedCache) -> Self {
        Self { cache }
    }

    pub fn eval(
        &self,
        state: &PluginsState,
        response: &mut Message,
        now: Instant,
    ) -> Result<RecordOutcome, CacheError> {
        let rcode = response.response_code();
        if !matches!(
            rcode,
            ResponseCode::NoError | ResponseCode::NXDomain | ResponseCode::NotAuth
        ) {
            return Ok(RecordOutcome::Skipped(SkipReason::Uncacheable(rcode)));
        }
        if response.truncated() {
            return Ok(RecordOutcome::Skipped(SkipReason::Truncated));
        }
        let Some(key) = CacheKey::for_message(response, state.dnssec) else {
            return Ok(RecordOutcome::Skipped(SkipReason::NoQuestion));
        };

        let ttl = response_ttl(response, &state.ttl_bounds());
        let entry = CachedEntry::new(response.clone(), now + ttl);

        let store = self.cache.get_or_init(state.settings.size)?;
        let expiration = entry.expiration;
        store.insert(key, entry);

        update_ttl(response, expiration, now);
        Ok(RecordOutcome::Cached { ttl })
    }
}

#[inline]
pub(crate) fn query_name(msg: &Message) -> String {
    msg.queries()
        .first()
        .map(|q| q.name().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HandleState;
    use crate::ttl::tests::{a_record, soa_record};
    use hickory_proto::op::Edns;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn settings() -> CacheSettings {
        CacheSettings {
            enabled: true,
            size: 64,
            min_ttl: 0,
            max_ttl: 3600,
            neg_min_ttl: 0,
            neg_max_ttl: 600,
        }
    }

    fn query(id: u16, qname: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(qname).expect("qname"), RecordType::A));
        msg
    }

    fn answer(id: u16, qname: &str, ttl: u32) -> Message {
        let mut msg = query(id, qname);
        msg.set_message_type(MessageType::Response);
        msg.add_answer(a_record(qname, ttl));
        msg
    }

    /// Seed the cache with an answer that expires `ttl` after `now`.
    fn seed(cache: &SharedCache, qname: &str, ttl: u32, now: Instant) {
        let state = PluginsState::new(settings(), &query(1, qname));
        let mut resp = answer(1, qname, ttl);
        let outcome = CacheWriter::new(cache).eval(&state, &mut resp, now).expect("write");
        assert_eq!(outcome, RecordOutcome::Cached { ttl: Duration::from_secs(ttl.into()) });
    }

    #[test]
    fn miss_before_any_write() {
        let cache = SharedCache::new();
        let q = query(7, "example.com.");
        let mut state = PluginsState::new(settings(), &q);
        let outcome = CacheReader::new(&cache).eval(&mut state, &q, Instant::now());
        assert_eq!(outcome, LookupOutcome::Miss);
        assert_eq!(state.action, PluginsAction::Forward);
        assert!(state.synth_response.is_none() && state.stale.is_none());
        assert!(!state.cache_hit);
    }

    #[test]
    fn fresh_hit_replays_with_remaining_ttl() {
        let cache = SharedCache::new();
        let now = Instant::now();
        seed(&cache, "example.com.", 60, now);

        let q = query(0xbeef, "EXAMPLE.com.");
        let mut state = PluginsState::new(settings(), &q);
        let outcome =
            CacheReader::new(&cache).eval(&mut state, &q, now + Duration::from_secs(10));

        assert_eq!(outcome, LookupOutcome::Fresh);
        assert_eq!(state.action, PluginsAction::Synth);
        assert!(state.cache_hit);
        let synth = state.synth_response.expect("synth response");
        assert_eq!(synth.id(), 0xbeef);
        assert_eq!(synth.message_type(), MessageType::Response);
        assert_eq!(synth.queries(), q.queries());
        assert!(synth.answers().iter().all(|r| r.ttl() == 50));
    }

    #[test]
    fn stale_hit_fills_side_channel_only() {
        let cache = SharedCache::new();
        let now = Instant::now();
        seed(&cache, "example.com.", 60, now);
        let later = now + Duration::from_secs(65);

        let q = query(9, "example.com.");
        let mut state = PluginsState::new(settings(), &q);
        let outcome = CacheReader::new(&cache).eval(&mut state, &q, later);

        assert_eq!(outcome, LookupOutcome::Stale);
        assert_eq!(state.action, PluginsAction::Forward);
        assert!(!state.cache_hit);
        assert!(state.synth_response.is_none());
        let stale = state.stale.expect("stale candidate");
        assert_eq!(stale.id(), 9);
        assert!(
            stale
                .answers()
                .iter()
                .all(|r| u64::from(r.ttl()) == STALE_RESPONSE_TTL.as_secs())
        );

        // the stored entry is left as it was
        let key = CacheKey::for_message(&q, false).expect("key");
        let stored = cache.get().and_then(|s| s.get(&key)).expect("entry");
        assert_eq!(stored.expiration, now + Duration::from_secs(60));
        assert!(stored.message.answers().iter().all(|r| r.ttl() == 60));
    }

    #[test]
    fn stale_at_exact_expiration() {
        let cache = SharedCache::new();
        let now = Instant::now();
        seed(&cache, "example.com.", 60, now);

        let q = query(3, "example.com.");
        let mut state = PluginsState::new(settings(), &q);
        let outcome =
            CacheReader::new(&cache).eval(&mut state, &q, now + Duration::from_secs(60));
        assert_eq!(outcome, LookupOutcome::Stale);
    }

    #[test]
    fn reads_yield_independent_copies() {
        let cache = SharedCache::new();
        let now = Instant::now();
        seed(&cache, "example.com.", 300, now);
        let reader = CacheReader::new(&cache);
        let q = query(1, "example.com.");

        let mut first = PluginsState::new(settings(), &q);
        let mut second = PluginsState::new(settings(), &q);
        reader.eval(&mut first, &q, now);
        reader.eval(&mut second, &q, now);

        let mut a = first.synth_response.expect("first");
        let b = second.synth_response.expect("second");
        a.set_id(4242);
        update_ttl(&mut a, now, now);

        assert_eq!(b.id(), 1);
        assert!(b.answers().iter().all(|r| r.ttl() == 300));
        let key = CacheKey::for_message(&q, false).expect("key");
        let stored = cache.get().and_then(|s| s.get(&key)).expect("entry");
        assert!(stored.message.answers().iter().all(|r| r.ttl() == 300));
    }

    #[test]
    fn dnssec_flag_separates_entries() {
        let cache = SharedCache::new();
        let now = Instant::now();
        seed(&cache, "example.com.", 300, now);

        let mut q = query(5, "example.com.");
        let mut edns = Edns::new();
        edns.set_dnssec_ok(true);
        q.set_edns(edns);

        let mut state = PluginsState::new(settings(), &q);
        assert!(state.dnssec);
        assert_eq!(CacheReader::new(&cache).eval(&mut state, &q, now), LookupOutcome::Miss);
    }

    #[test]
    fn writer_rewrites_response_ttl_to_clamped_value() {
        let cache = SharedCache::new();
        let now = Instant::now();
        let mut bounded = settings();
        bounded.min_ttl = 30;
        bounded.max_ttl = 300;

        let q = query(1, "example.com.");
        let state = PluginsState::new(bounded, &q);
        let mut resp = answer(1, "example.com.", 5);
        let outcome = CacheWriter::new(&cache).eval(&state, &mut resp, now).expect("write");

        assert_eq!(outcome, RecordOutcome::Cached { ttl: Duration::from_secs(30) });
        assert!(resp.answers().iter().all(|r| r.ttl() == 30));
    }

    #[test]
    fn negative_answers_are_cached() {
        let cache = SharedCache::new();
        let now = Instant::now();
        let q = query(1, "missing.example.com.");
        let state = PluginsState::new(settings(), &q);

        let mut resp = q.clone();
        resp.set_message_type(MessageType::Response);
        resp.set_response_code(ResponseCode::NXDomain);
        resp.add_name_server(soa_record("example.com.", 120));

        let outcome = CacheWriter::new(&cache).eval(&state, &mut resp, now).expect("write");
        assert_eq!(outcome, RecordOutcome::Cached { ttl: Duration::from_secs(120) });
    }

    #[test]
    fn servfail_and_truncated_are_not_stored() {
        let cache = SharedCache::new();
        let now = Instant::now();
        let q = query(1, "example.com.");
        let state = PluginsState::new(settings(), &q);
        let writer = CacheWriter::new(&cache);

        let mut servfail = answer(1, "example.com.", 60);
        servfail.set_response_code(ResponseCode::ServFail);
        assert_eq!(
            writer.eval(&state, &mut servfail, now),
            Ok(RecordOutcome::Skipped(SkipReason::Uncacheable(ResponseCode::ServFail)))
        );

        let mut truncated = answer(1, "example.com.", 60);
        truncated.set_truncated(true);
        assert_eq!(
            writer.eval(&state, &mut truncated, now),
            Ok(RecordOutcome::Skipped(SkipReason::Truncated))
        );

        assert_eq!(cache.state(), HandleState::Uninitialized);
        assert!(truncated.answers().iter().all(|r| r.ttl() == 60));
    }

    #[test]
    fn construction_error_skips_insert_and_is_retried() {
        let cache = SharedCache::new();
        let now = Instant::now();
        let q = query(1, "example.com.");
        let writer = CacheWriter::new(&cache);

        let mut broken = settings();
        broken.size = 0;
        let state = PluginsState::new(broken, &q);
        let mut resp = answer(1, "example.com.", 60);
        assert_eq!(
            writer.eval(&state, &mut resp, now),
            Err(CacheError::InvalidCapacity(0))
        );
        assert!(resp.answers().iter().all(|r| r.ttl() == 60));
        assert!(cache.get().is_none());

        let state = PluginsState::new(settings(), &q);
        assert!(matches!(
            writer.eval(&state, &mut resp, now),
            Ok(RecordOutcome::Cached { .. })
        ));
        assert_eq!(cache.state(), HandleState::Ready { capacity: 64 });
    }

    #[test]
    fn concurrent_writers_share_one_store() {
        let cache = SharedCache::new();
        let now = Instant::now();
        let barrier = std::sync::Barrier::new(8);

        std::thread::scope(|s| {
            for i in 0..8usize {
                let cache = &cache;
                let barrier = &barrier;
                s.spawn(move || {
                    let qname = format!("host{i}.example.com.");
                    let mut sized = settings();
                    sized.size = 32 * (i + 1);
                    let state = PluginsState::new(sized, &query(1, &qname));
                    let mut resp = answer(1, &qname, 120);
                    barrier.wait();
                    let outcome = CacheWriter::new(cache).eval(&state, &mut resp, now);
                    assert!(matches!(outcome, Ok(RecordOutcome::Cached { .. })));
                });
            }
        });

        let reader = CacheReader::new(&cache);
        for i in 0..8 {
            let q = query(2, &format!("host{i}.example.com."));
            let mut state = PluginsState::new(settings(), &q);
            assert_eq!(reader.eval(&mut state, &q, now), LookupOutcome::Fresh);
        }
    }
}
