//! Builders for the messages the transaction layer synthesizes itself:
//! provisional and final responses, the ACK for a non-2xx final response
//! and CANCEL.

use bytes::Bytes;
use rand::Rng;
use uuid::Uuid;

use super::{CSeq, Method, SipMessage, StartLine, MAGIC_COOKIE};

/// Generate a fresh RFC 3261 branch parameter
pub fn generate_branch() -> String {
    format!("{}{}", MAGIC_COOKIE, Uuid::new_v4().simple())
}

/// Generate a random From/To tag
pub fn generate_tag() -> String {
    format!("{:08x}", rand::thread_rng().r#gen::<u32>())
}

/// Default reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        410 => "Gone",
        430 => "Flow Failed",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        _ => match code / 100 {
            1 => "Provisional",
            2 => "Success",
            3 => "Redirection",
            4 => "Client Error",
            5 => "Server Error",
            _ => "Global Failure",
        },
    }
}

/// Build a response to `request`.
///
/// Via, From, To, Call-ID and CSeq are copied from the request. A To tag is
/// added for anything but 100 when the request carried none.
pub fn make_response(request: &SipMessage, code: u16, reason: Option<&str>) -> SipMessage {
    let mut to = request.to.clone();
    if code > 100 && to.tag.is_none() {
        to.tag = Some(generate_tag());
    }

    SipMessage {
        start: StartLine::Response {
            code,
            reason: reason.unwrap_or_else(|| reason_phrase(code)).to_string(),
        },
        vias: request.vias.clone(),
        from: request.from.clone(),
        to,
        call_id: request.call_id.clone(),
        cseq: request.cseq.clone(),
        contacts: Vec::new(),
        routes: Vec::new(),
        max_forwards: None,
        retry_after: None,
        warnings: Vec::new(),
        headers: Vec::new(),
        body: Bytes::new(),
        source: None,
        destination: None,
        force_target: None,
        external: false,
        tu: request.tu,
        invalid_reason: None,
    }
}

/// 100 Trying for `request`
pub fn make_100(request: &SipMessage) -> SipMessage {
    make_response(request, 100, None)
}

/// 503 with Retry-After for a request refused under load. ACKs and
/// responses get nothing.
pub fn make_try_later(msg: &SipMessage, retry_after: u32) -> Option<SipMessage> {
    if !msg.is_request() || *msg.method() == Method::Ack {
        return None;
    }
    let mut response = make_response(msg, 503, None);
    response.retry_after = Some(retry_after);
    Some(response)
}

/// Build the ACK for a non-2xx final response (RFC 3261 17.1.1.3).
///
/// The ACK reuses the INVITE's Request-URI, top Via and Route set, and takes
/// its To header (with the remote tag) from the response.
pub fn make_failure_ack(invite: &SipMessage, response: &SipMessage) -> SipMessage {
    let uri = invite
        .request_uri()
        .cloned()
        .unwrap_or_else(|| invite.to.uri.clone());

    let mut ack = SipMessage::request(
        Method::Ack,
        uri,
        invite.from.clone(),
        response.to.clone(),
        invite.call_id.clone(),
        invite.cseq.seq,
    );
    ack.vias = invite.vias.iter().take(1).cloned().collect();
    ack.routes = invite.routes.clone();
    ack.tu = invite.tu;
    ack.destination = invite.destination.clone();
    ack.force_target = invite.force_target.clone();
    ack
}

/// Build a CANCEL for `invite` (RFC 3261 9.1).
pub fn make_cancel(invite: &SipMessage) -> SipMessage {
    let uri = invite
        .request_uri()
        .cloned()
        .unwrap_or_else(|| invite.to.uri.clone());

    let mut cancel = SipMessage::request(
        Method::Cancel,
        uri,
        invite.from.clone(),
        invite.to.clone(),
        invite.call_id.clone(),
        invite.cseq.seq,
    );
    cancel.cseq = CSeq {
        seq: invite.cseq.seq,
        method: Method::Cancel,
    };
    cancel.vias = invite.vias.iter().take(1).cloned().collect();
    cancel.routes = invite.routes.clone();
    cancel.tu = invite.tu;
    cancel.destination = invite.destination.clone();
    cancel.force_target = invite.force_target.clone();
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NameAddr, Via};
    use crate::tuple::TransportType;

    fn invite() -> SipMessage {
        SipMessage::request(
            Method::Invite,
            "sip:bob@example.com".parse().unwrap(),
            NameAddr::new("sip:alice@example.com".parse().unwrap()).with_tag("a1"),
            NameAddr::new("sip:bob@example.com".parse().unwrap()),
            "call-1",
            7,
        )
        .with_via(Via::new(TransportType::Udp, "10.0.0.2", Some(5060), "z9hG4bKdown"))
        .with_via(Via::new(TransportType::Udp, "10.0.0.1", Some(5060), "z9hG4bKtop"))
    }

    #[test]
    fn test_response_copies_dialog_identifiers() {
        let req = invite();
        let resp = make_response(&req, 180, None);
        assert_eq!(resp.status_code(), Some(180));
        assert_eq!(resp.vias, req.vias);
        assert_eq!(resp.call_id, "call-1");
        assert_eq!(resp.cseq, req.cseq);
        assert!(resp.to.tag.is_some());

        let trying = make_100(&req);
        assert!(trying.to.tag.is_none());
        assert_eq!(trying.method(), &Method::Invite);
    }

    #[test]
    fn test_failure_ack_uses_response_to_tag() {
        let req = invite();
        let resp = make_response(&req, 486, None);
        let ack = make_failure_ack(&req, &resp);
        assert_eq!(ack.method(), &Method::Ack);
        assert_eq!(ack.vias.len(), 1);
        assert_eq!(ack.transaction_id(), req.transaction_id());
        assert_eq!(ack.to.tag, resp.to.tag);
        assert_eq!(ack.cseq.seq, 7);
        assert_eq!(ack.cseq.method, Method::Ack);
    }

    #[test]
    fn test_cancel_shares_branch() {
        let req = invite();
        let cancel = make_cancel(&req);
        assert_eq!(cancel.method(), &Method::Cancel);
        assert_eq!(cancel.transaction_id(), req.transaction_id());
        assert_eq!(cancel.cseq.method, Method::Cancel);
        assert_eq!(cancel.to.tag, None);
    }

    #[test]
    fn test_try_later_only_for_requests_other_than_ack() {
        let req = invite();
        let busy = make_try_later(&req, 40).unwrap();
        assert_eq!(busy.status_code(), Some(503));
        assert_eq!(busy.retry_after, Some(40));

        let resp = make_response(&req, 486, None);
        assert!(make_try_later(&resp, 40).is_none());
        assert!(make_try_later(&make_failure_ack(&req, &resp), 40).is_none());
    }

    #[test]
    fn test_generated_branch_has_cookie() {
        let branch = generate_branch();
        assert!(branch.starts_with(MAGIC_COOKIE));
        assert_ne!(branch, generate_branch());
    }
}
