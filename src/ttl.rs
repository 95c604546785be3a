use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Record, RecordType};

/// 正/负响应的 TTL 上下限 / min-max TTL bounds for positive and negative answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlBounds {
    pub positive_min: Duration,
    pub positive_max: Duration,
    pub negative_min: Duration,
    pub negative_max: Duration,
}

impl TtlBounds {
    pub fn from_secs(min: u32, max: u32, neg_min: u32, neg_max: u32) -> Self {
        Self {
            positive_min: Duration::from_secs(min.into()),
            positive_max: Duration::from_secs(max.into()),
            negative_min: Duration::from_secs(neg_min.into()),
            negative_max: Duration::from_secs(neg_max.into()),
        }
    }
}

/// Positive means NOERROR with at least one answer record.
#[inline]
pub fn is_positive(msg: &Message) -> bool {
    msg.response_code() == ResponseCode::NoError && !msg.answers().is_empty()
}

/// How long `msg` may be served from cache.
///
/// The smallest record TTL of the answer section (or the authority section
/// for answers without records) is clamped into the bounds matching the
/// response class. Responses that are neither NOERROR nor NXDOMAIN, or that
/// carry no records at all, get the negative minimum.
pub fn response_ttl(msg: &Message, bounds: &TtlBounds) -> Duration {
    if !matches!(msg.response_code(), ResponseCode::NoError | ResponseCode::NXDomain) {
        return bounds.negative_min;
    }

    let (min, max) = if is_positive(msg) {
        (bounds.positive_min, bounds.positive_max)
    } else {
        (bounds.negative_min, bounds.negative_max)
    };

    let section = if !msg.answers().is_empty() {
        msg.answers()
    } else {
        msg.name_servers()
    };

    let Some(lowest) = section.iter().map(Record::ttl).min() else {
        return bounds.negative_min;
    };

    // min wins over max when misconfigured, never panic like Duration::clamp
    Duration::from_secs(lowest.into()).min(max).max(min)
}

/// Seconds left until `expiration`, rounded to the nearest second.
#[inline]
pub fn remaining_secs(expiration: Instant, now: Instant) -> u32 {
    let until = expiration.saturating_duration_since(now);
    let mut secs = until.as_secs();
    if until.subsec_millis() >= 500 {
        secs += 1;
    }
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Rewrite every record TTL (OPT excluded) to the time left until `expiration`.
pub fn update_ttl(msg: &mut Message, expiration: Instant, now: Instant) {
    let ttl = remaining_secs(expiration, now);
    let set = |mut records: Vec<Record>| {
        for record in records.iter_mut() {
            if record.record_type() != RecordType::OPT {
                record.set_ttl(ttl);
            }
        }
        records
    };

    let answers = set(msg.take_answers());
    msg.insert_answers(answers);
    let name_servers = set(msg.take_name_servers());
    msg.insert_name_servers(name_servers);
    let additionals = set(msg.take_additionals());
    msg.insert_additionals(additionals);
}
