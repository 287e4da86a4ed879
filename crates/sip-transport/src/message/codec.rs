//! Text form of [`SipMessage`]
//!
//! Covers the headers the stack models and passes everything else through
//! untouched. Stream transports use [`drain_frames`] to cut complete
//! messages out of a receive buffer by Content-Length.

use std::fmt::Write as _;

use bytes::{Bytes, BytesMut};

use super::uri::split_host_port;
use super::{CSeq, Method, NameAddr, SipMessage, StartLine, Uri, Via, Warning};
use crate::error::{Error, Result};
use crate::tuple::TransportType;

const SIP_VERSION: &str = "SIP/2.0";

/// Serialize a message
pub fn encode(msg: &SipMessage) -> Bytes {
    let mut out = String::with_capacity(512);

    match &msg.start {
        StartLine::Request { method, uri } => {
            let _ = write!(out, "{} {} {}\r\n", method, uri, SIP_VERSION);
        }
        StartLine::Response { code, reason } => {
            let _ = write!(out, "{} {} {}\r\n", SIP_VERSION, code, reason);
        }
    }

    for via in &msg.vias {
        let _ = write!(out, "Via: {}/{} {}", SIP_VERSION, via.transport, via.sent_by());
        if let Some(branch) = &via.branch {
            let _ = write!(out, ";branch={}", branch);
        }
        if let Some(received) = &via.received {
            let _ = write!(out, ";received={}", received);
        }
        if via.rport {
            out.push_str(";rport");
        }
        out.push_str("\r\n");
    }
    if let Some(max_forwards) = msg.max_forwards {
        let _ = write!(out, "Max-Forwards: {}\r\n", max_forwards);
    }
    for route in &msg.routes {
        let _ = write!(out, "Route: {}\r\n", format_name_addr(route));
    }
    let _ = write!(out, "From: {}\r\n", format_name_addr(&msg.from));
    let _ = write!(out, "To: {}\r\n", format_name_addr(&msg.to));
    let _ = write!(out, "Call-ID: {}\r\n", msg.call_id);
    let _ = write!(out, "CSeq: {} {}\r\n", msg.cseq.seq, msg.cseq.method);
    for contact in &msg.contacts {
        let _ = write!(out, "Contact: {}\r\n", format_name_addr(contact));
    }
    if let Some(retry_after) = msg.retry_after {
        let _ = write!(out, "Retry-After: {}\r\n", retry_after);
    }
    for warning in &msg.warnings {
        let _ = write!(out, "Warning: {} {} \"{}\"\r\n", warning.code, warning.agent, warning.text);
    }
    for (name, value) in &msg.headers {
        let _ = write!(out, "{}: {}\r\n", name, value);
    }
    let _ = write!(out, "Content-Length: {}\r\n\r\n", msg.body.len());

    let mut buf = BytesMut::with_capacity(out.len() + msg.body.len());
    buf.extend_from_slice(out.as_bytes());
    buf.extend_from_slice(&msg.body);
    buf.freeze()
}

fn format_name_addr(addr: &NameAddr) -> String {
    let mut s = String::new();
    if let Some(name) = &addr.display_name {
        let _ = write!(s, "\"{}\" ", name);
    }
    let _ = write!(s, "<{}>", addr.uri);
    if let Some(tag) = &addr.tag {
        let _ = write!(s, ";tag={}", tag);
    }
    s
}

/// Parse one complete message
pub fn decode(data: &[u8]) -> Result<SipMessage> {
    let (head_len, body_start) = find_header_end(data).ok_or_else(|| Error::parse("incomplete header"))?;
    let head = std::str::from_utf8(&data[..head_len]).map_err(|_| Error::parse("header is not UTF-8"))?;

    let mut lines = unfold(head).into_iter();
    let first = lines.next().ok_or_else(|| Error::parse("empty message"))?;
    let start = parse_start_line(&first)?;

    let mut vias = Vec::new();
    let mut from = None;
    let mut to = None;
    let mut call_id = None;
    let mut cseq = None;
    let mut contacts = Vec::new();
    let mut routes = Vec::new();
    let mut max_forwards = None;
    let mut retry_after = None;
    let mut warnings = Vec::new();
    let mut headers = Vec::new();
    let mut content_length = None;

    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::parse(format!("malformed header line '{}'", line)))?;
        let value = value.trim();
        match canonical_name(name.trim()).as_str() {
            "via" => {
                for item in split_top_level(value) {
                    vias.push(parse_via(item)?);
                }
            }
            "from" => from = Some(parse_name_addr(value)?),
            "to" => to = Some(parse_name_addr(value)?),
            "call-id" => call_id = Some(value.to_string()),
            "cseq" => cseq = Some(parse_cseq(value)?),
            "contact" => {
                if value != "*" {
                    for item in split_top_level(value) {
                        contacts.push(parse_name_addr(item)?);
                    }
                }
            }
            "route" => {
                for item in split_top_level(value) {
                    routes.push(parse_name_addr(item)?);
                }
            }
            "max-forwards" => max_forwards = value.parse().ok(),
            "retry-after" => {
                retry_after = value.split(|c: char| c == ';' || c == '(').next().and_then(|v| v.trim().parse().ok())
            }
            "warning" => {
                for item in split_top_level(value) {
                    if let Some(w) = parse_warning(item) {
                        warnings.push(w);
                    }
                }
            }
            "content-length" => {
                content_length = Some(value.parse::<usize>().map_err(|_| Error::parse("bad Content-Length"))?)
            }
            _ => headers.push((name.trim().to_string(), value.to_string())),
        }
    }

    let body = &data[body_start..];
    let body = match content_length {
        Some(len) if len > body.len() => return Err(Error::parse("body shorter than Content-Length")),
        Some(len) => Bytes::copy_from_slice(&body[..len]),
        None => Bytes::copy_from_slice(body),
    };

    let cseq = cseq.ok_or_else(|| Error::parse("missing CSeq"))?;
    let invalid_reason = match &start {
        StartLine::Request { method, .. } if *method != cseq.method => {
            Some("CSeq method does not match request method".to_string())
        }
        _ => None,
    };

    Ok(SipMessage {
        start,
        vias,
        from: from.ok_or_else(|| Error::parse("missing From"))?,
        to: to.ok_or_else(|| Error::parse("missing To"))?,
        call_id: call_id.ok_or_else(|| Error::parse("missing Call-ID"))?,
        cseq,
        contacts,
        routes,
        max_forwards,
        retry_after,
        warnings,
        headers,
        body,
        source: None,
        destination: None,
        force_target: None,
        external: false,
        tu: None,
        invalid_reason,
    })
}

/// Largest header block accepted on a stream
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Largest message, headers and body, accepted on a stream
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Cut complete messages off the front of a stream buffer.
///
/// Leading CRLF keep-alives are discarded. Incomplete trailing data stays in
/// `buf` for the next read. A header block longer than [`MAX_HEADER_SIZE`]
/// or a message longer than [`MAX_MESSAGE_SIZE`] is an error; the stream
/// cannot be resynchronized and should be closed.
pub fn drain_frames(buf: &mut BytesMut) -> Result<Vec<Bytes>> {
    let mut frames = Vec::new();
    loop {
        let skip = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
        let _ = buf.split_to(skip);
        if buf.is_empty() {
            break;
        }
        let window = &buf[..buf.len().min(MAX_HEADER_SIZE + 4)];
        let Some((head_len, body_start)) = find_header_end(window) else {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(Error::MessageTooLarge {
                    size: buf.len(),
                    limit: MAX_HEADER_SIZE,
                });
            }
            break;
        };
        if head_len > MAX_HEADER_SIZE {
            return Err(Error::MessageTooLarge {
                size: head_len,
                limit: MAX_HEADER_SIZE,
            });
        }
        let head = std::str::from_utf8(&buf[..head_len]).map_err(|_| Error::parse("header is not UTF-8"))?;
        let length = content_length_of(head)?;
        let total = match body_start.checked_add(length) {
            Some(total) if total <= MAX_MESSAGE_SIZE => total,
            other => {
                return Err(Error::MessageTooLarge {
                    size: other.unwrap_or(usize::MAX),
                    limit: MAX_MESSAGE_SIZE,
                })
            }
        };
        if buf.len() < total {
            break;
        }
        frames.push(buf.split_to(total).freeze());
    }
    Ok(frames)
}

fn content_length_of(head: &str) -> Result<usize> {
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if canonical_name(name.trim()) == "content-length" {
                return value.trim().parse().map_err(|_| Error::parse("bad Content-Length"));
            }
        }
    }
    // stream transports require Content-Length (RFC 3261 18.3)
    Err(Error::parse("missing Content-Length on stream transport"))
}

/// Returns (header length, body offset)
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    data.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, pos + 2))
}

/// Join folded header lines
fn unfold(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in head.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

fn canonical_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "v" => "via".into(),
        "f" => "from".into(),
        "t" => "to".into(),
        "i" => "call-id".into(),
        "m" => "contact".into(),
        "l" => "content-length".into(),
        _ => lower,
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix(SIP_VERSION) {
        let rest = rest.trim_start();
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let code: u16 = code.parse().map_err(|_| Error::parse("bad status code"))?;
        if !(100..700).contains(&code) {
            return Err(Error::parse(format!("status code {} out of range", code)));
        }
        return Ok(StartLine::Response {
            code,
            reason: reason.to_string(),
        });
    }

    let mut parts = line.split_whitespace();
    let (Some(method), Some(uri), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::parse(format!("bad request line '{}'", line)));
    };
    if version != SIP_VERSION {
        return Err(Error::parse(format!("unsupported version '{}'", version)));
    }
    Ok(StartLine::Request {
        method: method.parse()?,
        uri: uri.parse()?,
    })
}

fn parse_via(value: &str) -> Result<Via> {
    let (protocol, rest) = value
        .trim()
        .split_once(char::is_whitespace)
        .ok_or_else(|| Error::parse("bad Via"))?;
    let transport = protocol
        .rsplit('/')
        .next()
        .ok_or_else(|| Error::parse("bad Via protocol"))?
        .parse()?;

    let mut parts = rest.trim().split(';');
    let sent_by = parts.next().unwrap_or_default().trim();
    let (host, port) = split_host_port(sent_by).ok_or_else(|| Error::parse("bad Via sent-by"))?;

    let mut via = Via {
        transport,
        host: host.to_string(),
        port,
        branch: None,
        rport: false,
        received: None,
    };
    for param in parts {
        let param = param.trim();
        let (name, value) = match param.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim())),
            None => (param, None),
        };
        match name.to_ascii_lowercase().as_str() {
            "branch" => via.branch = value.map(str::to_string),
            "rport" => via.rport = true,
            "received" => via.received = value.map(str::to_string),
            _ => {}
        }
    }
    Ok(via)
}

fn parse_name_addr(value: &str) -> Result<NameAddr> {
    let value = value.trim();
    let (display_name, uri, params) = if let Some(open) = value.find('<') {
        let close = value[open..]
            .find('>')
            .map(|c| open + c)
            .ok_or_else(|| Error::parse("unterminated name-addr"))?;
        let name = value[..open].trim().trim_matches('"');
        let name = (!name.is_empty()).then(|| name.to_string());
        (name, &value[open + 1..close], &value[close + 1..])
    } else {
        // addr-spec form: parameters after the URI belong to the header
        match value.find(';') {
            Some(pos) => (None, &value[..pos], &value[pos..]),
            None => (None, value, ""),
        }
    };

    let tag = params.split(';').find_map(|p| {
        let (n, v) = p.trim().split_once('=')?;
        n.eq_ignore_ascii_case("tag").then(|| v.to_string())
    });

    Ok(NameAddr {
        display_name,
        uri: uri.parse::<Uri>()?,
        tag,
    })
}

fn parse_cseq(value: &str) -> Result<CSeq> {
    let mut parts = value.split_whitespace();
    let seq = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::parse("bad CSeq number"))?;
    let method: Method = parts.next().ok_or_else(|| Error::parse("missing CSeq method"))?.parse()?;
    Ok(CSeq { seq, method })
}

fn parse_warning(value: &str) -> Option<Warning> {
    let mut parts = value.trim().splitn(3, ' ');
    let code = parts.next()?.parse().ok()?;
    let agent = parts.next()?.to_string();
    let text = parts.next()?.trim().trim_matches('"').to_string();
    Some(Warning { code, agent, text })
}

/// Split a header value on commas that are outside `<...>` and quotes
fn split_top_level(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                items.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items.retain(|s| !s.is_empty());
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776asdhds;rport\r\n\
        v: SIP/2.0/UDP 10.0.0.2;branch=z9hG4bKlower\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@example.com>\r\n\
        From: \"Alice\" <sip:alice@example.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@10.0.0.1>\r\n\
        Subject: lunch\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\n";

    #[test]
    fn test_decode_request() {
        let msg = decode(INVITE.as_bytes()).unwrap();
        assert_eq!(msg.method(), &Method::Invite);
        assert_eq!(msg.vias.len(), 2);
        let top = msg.top_via().unwrap();
        assert_eq!(top.transport, TransportType::Udp);
        assert_eq!(top.host, "10.0.0.1");
        assert_eq!(top.port, Some(5060));
        assert!(top.rport);
        assert_eq!(msg.transaction_id().as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(msg.from.tag.as_deref(), Some("1928301774"));
        assert_eq!(msg.from.display_name.as_deref(), Some("Alice"));
        assert_eq!(msg.to.tag, None);
        assert_eq!(msg.cseq.seq, 314159);
        assert_eq!(msg.contacts.len(), 1);
        assert_eq!(msg.headers, vec![("Subject".to_string(), "lunch".to_string())]);
        assert_eq!(&msg.body[..], b"v=0\n");
        assert!(msg.invalid_reason.is_none());
    }

    #[test]
    fn test_encode_then_decode_response() {
        let req = decode(INVITE.as_bytes()).unwrap();
        let mut resp = crate::message::make_response(&req, 503, Some("No DNS results"));
        resp.retry_after = Some(40);
        resp.warnings.push(Warning {
            code: 399,
            agent: "proxy.example.com".into(),
            text: "No other DNS entries to try".into(),
        });
        let decoded = decode(&encode(&resp)).unwrap();
        assert_eq!(decoded.status_code(), Some(503));
        assert_eq!(decoded.retry_after, Some(40));
        assert_eq!(decoded.warnings, resp.warnings);
        assert_eq!(decoded.vias, resp.vias);
        assert_eq!(decoded.to.tag, resp.to.tag);
    }

    #[test]
    fn test_policy_invalid_request_is_flagged() {
        let text = INVITE.replace("CSeq: 314159 INVITE", "CSeq: 314159 BYE");
        let msg = decode(text.as_bytes()).unwrap();
        assert!(msg.invalid_reason.is_some());
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert!(decode(b"garbage").is_err());
        assert!(decode(b"INVITE sip:bob@example.com SIP/2.0\r\nVia: x\r\n\r\n").is_err());
        let no_cseq = INVITE.replace("CSeq: 314159 INVITE\r\n", "");
        assert!(decode(no_cseq.as_bytes()).is_err());
    }

    #[test]
    fn test_drain_frames_handles_partial_and_keepalive() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\r\n\r\n");
        buf.extend_from_slice(INVITE.as_bytes());
        buf.extend_from_slice(&INVITE.as_bytes()[..40]);

        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], INVITE.as_bytes());
        assert_eq!(buf.len(), 40);

        buf.extend_from_slice(&INVITE.as_bytes()[40..]);
        let frames = drain_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_frames_rejects_huge_content_length() {
        let mut buf = BytesMut::new();
        let text = INVITE.replace("Content-Length: ", "Content-Length: 18446744073709551615\r\nX-Old-Length: ");
        buf.extend_from_slice(text.as_bytes());
        assert!(matches!(drain_frames(&mut buf), Err(Error::MessageTooLarge { .. })));

        let mut buf = BytesMut::new();
        let text = INVITE.replace("Content-Length: ", "Content-Length: 2000000\r\nX-Old-Length: ");
        buf.extend_from_slice(text.as_bytes());
        assert!(matches!(
            drain_frames(&mut buf),
            Err(Error::MessageTooLarge { limit: MAX_MESSAGE_SIZE, .. })
        ));
    }

    #[test]
    fn test_drain_frames_rejects_endless_header() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"INVITE sip:bob@example.com SIP/2.0\r\n");
        let filler = "X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n";
        while buf.len() <= MAX_HEADER_SIZE {
            buf.extend_from_slice(filler.as_bytes());
        }
        assert!(matches!(
            drain_frames(&mut buf),
            Err(Error::MessageTooLarge { limit: MAX_HEADER_SIZE, .. })
        ));
    }
}
