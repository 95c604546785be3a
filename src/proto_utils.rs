use std::ops::Range;

const HEADER_LEN: usize = 12;

/// 首个问题域名在包内的区间（不允许压缩指针）/ Span of the first question name, uncompressed only.
fn first_qname_span(packet: &[u8]) -> Option<Range<usize>> {
    if packet.len() < HEADER_LEN || u16::from_be_bytes([packet[4], packet[5]]) == 0 {
        return None;
    }
    let mut pos = HEADER_LEN;
    loop {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            return Some(HEADER_LEN..pos + 1);
        }
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + len;
    }
}

/// Copy the query's question name bytes over the encoded reply so the client
/// sees its own spelling (0x20 case randomisation). Only done when both names
/// are equal ignoring ASCII case; returns whether bytes were copied.
pub fn restore_qname_case(reply: &mut [u8], query: &[u8]) -> bool {
    let (Some(r), Some(q)) = (first_qname_span(reply), first_qname_span(query)) else {
        return false;
    };
    // length octets are < 64 and never collide with ASCII letters
    if !reply[r.clone()].eq_ignore_ascii_case(&query[q.clone()]) {
        return false;
    }
    reply[r].copy_from_slice(&query[q]);
    true
}

/// End offset of the whole question section.
fn question_end(packet: &[u8]) -> Option<usize> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    let mut pos = HEADER_LEN;
    for _ in 0..qd_count {
        loop {
            let len = *packet.get(pos)?;
            if len == 0 {
                pos += 1;
                break;
            }
            if len & 0xC0 == 0xC0 {
                pos += 2;
                break;
            }
            pos += 1 + len as usize;
        }
        // Type(2) + Class(2)
        pos += 4;
    }
    (pos <= packet.len()).then_some(pos)
}

/// Header plus question only, TC set, record counts zeroed.
pub fn truncated_reply(encoded: &[u8]) -> Option<Vec<u8>> {
    let end = question_end(encoded)?;
    let mut out = encoded[..end].to_vec();
    out[2] |= 0x02;
    out[6..HEADER_LEN].fill(0);
    Some(out)
}
