use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use sha2::{Digest, Sha512_256};

/// 32 字节缓存键 / 32-byte cache key (SHA-512/256 digest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Derive the key from the first question of `msg`.
    /// Returns `None` when the message carries no question.
    #[inline]
    pub fn for_message(msg: &Message, dnssec: bool) -> Option<Self> {
        let question = msg.queries().first()?;
        Some(derive(
            question.name(),
            question.query_type(),
            question.query_class(),
            dnssec,
        ))
    }
}

/// Header layout: qtype (LE u16), qclass (LE u16), DO flag byte, then the
/// normalized wire-format name.
pub fn derive(name: &Name, qtype: RecordType, qclass: DNSClass, dnssec: bool) -> CacheKey {
    let mut header = [0u8; 5];
    header[0..2].copy_from_slice(&u16::from(qtype).to_le_bytes());
    header[2..4].copy_from_slice(&u16::from(qclass).to_le_bytes());
    header[4] = u8::from(dnssec);

    let mut hasher = Sha512_256::new();
    hasher.update(header);
    hasher.update(normalize_qname(name));
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    CacheKey(digest)
}

/// Length-prefixed wire encoding with ASCII letters lowered; other bytes are
/// kept as-is. The root label is always appended so `example.com` and
/// `example.com.` normalize the same.
pub fn normalize_qname(name: &Name) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.iter() {
        out.push(label.len() as u8);
        out.extend(label.iter().map(u8::to_ascii_lowercase));
    }
    out.push(0);
    out
}
