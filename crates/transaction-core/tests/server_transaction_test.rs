//! Server transactions, stateless replies and TU routing

mod common;

use std::time::Duration;

use common::*;
use rvoip_stack_transaction::fifo::FifoLimits;
use rvoip_stack_transaction::{
    Machine, MessageFilter, StackConfig, State, TransactionId, TransactionMessage, TuMessage, TuRegistration,
};
use rvoip_stack_transport::message::{make_response, StartLine, TuId};
use rvoip_stack_transport::{Method, SipMessage};

const BRANCH: &str = "z9hG4bKsrv1";

/// Deliver an INVITE from the peer and return the copy the TU received
fn incoming_invite(h: &mut Harness) -> SipMessage {
    h.receive(wire_request(Method::Invite, BRANCH), PEER);
    let mut to_tu = h.tu_sip();
    assert_eq!(to_tu.len(), 1);
    to_tu.remove(0)
}

fn sent_codes(h: &Harness) -> Vec<u16> {
    h.wire.take_sent().iter().filter_map(|(_, m)| m.status_code()).collect()
}

#[test]
fn test_invite_gets_100_after_t100() {
    let mut h = Harness::new();
    incoming_invite(&mut h);
    assert_eq!(h.wire.sent_count(), 0);

    h.advance(Duration::from_millis(80));
    let sent = h.wire.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.status_code(), Some(100));
    assert_eq!(sent[0].0.addr(), PEER.parse().unwrap());

    let id = TransactionId::from(BRANCH);
    assert_eq!(h.controller.server_transaction(&id).unwrap().state(), State::Proceeding);
}

#[test]
fn test_invite_retransmission_resends_last_response() {
    let mut h = Harness::new();
    let invite = incoming_invite(&mut h);
    h.send(make_response(&invite, 180, None));
    assert_eq!(sent_codes(&h), vec![180]);

    h.receive(wire_request(Method::Invite, BRANCH), PEER);
    assert_eq!(sent_codes(&h), vec![180]);
    assert!(h.tu_sip().is_empty(), "retransmissions are absorbed");
}

#[test]
fn test_failure_response_retransmitted_until_ack() {
    let mut h = Harness::new();
    let invite = incoming_invite(&mut h);
    h.send(make_response(&invite, 486, None));
    assert_eq!(sent_codes(&h), vec![486]);

    // Timer G at T1 then 2*T1
    h.advance(Duration::from_millis(2000));
    assert_eq!(sent_codes(&h), vec![486, 486]);

    h.receive(wire_request(Method::Ack, BRANCH), PEER);
    let id = TransactionId::from(BRANCH);
    assert_eq!(h.controller.server_transaction(&id).unwrap().state(), State::Confirmed);

    h.advance(Duration::from_millis(4000));
    assert_eq!(h.wire.sent_count(), 0);
}

#[test]
fn test_ack_retransmissions_are_absorbed() {
    let mut h = Harness::new();
    let invite = incoming_invite(&mut h);
    h.send(make_response(&invite, 603, None));
    h.wire.take_sent();

    h.receive(wire_request(Method::Ack, BRANCH), PEER);
    h.receive(wire_request(Method::Ack, BRANCH), PEER);
    h.receive(wire_request(Method::Ack, BRANCH), PEER);

    assert!(h.tu_sip().is_empty());
    assert_eq!(h.wire.sent_count(), 0);
    let id = TransactionId::from(BRANCH);
    assert_eq!(h.controller.server_transaction(&id).unwrap().state(), State::Confirmed);

    // Timer I is T4
    h.advance(Duration::from_secs(5));
    assert!(h.controller.server_transaction(&id).is_none());
}

#[test]
fn test_missing_ack_times_out_with_timer_h() {
    let mut h = Harness::new();
    let invite = incoming_invite(&mut h);
    h.send(make_response(&invite, 480, None));

    h.advance(Duration::from_secs(32));
    assert_eq!(h.controller.server_count(), 0);
}

#[test]
fn test_2xx_leaves_stale_server_invite() {
    let mut h = Harness::new();
    let invite = incoming_invite(&mut h);
    h.send(make_response(&invite, 200, None));
    assert_eq!(sent_codes(&h), vec![200]);

    let id = TransactionId::from(BRANCH);
    assert_eq!(h.controller.server_transaction(&id).unwrap().machine(), Machine::ServerStale);

    // a late INVITE retransmission still matches and is dropped
    h.receive(wire_request(Method::Invite, BRANCH), PEER);
    assert!(h.tu_sip().is_empty());

    // a TU retransmission of the 2xx goes back to the original source
    h.send(make_response(&invite, 200, None));
    let sent = h.wire.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.addr(), PEER.parse().unwrap());

    h.advance(Duration::from_secs(32));
    assert!(h.controller.server_transaction(&id).is_none());
}

#[test]
fn test_abandoned_invite_answers_500() {
    let mut h = Harness::new();
    incoming_invite(&mut h);
    h.advance(Duration::from_millis(100));
    assert_eq!(sent_codes(&h), vec![100]);

    h.controller
        .process(TransactionMessage::AbandonServerTransaction(TransactionId::from(BRANCH)), h.now);
    assert_eq!(sent_codes(&h), vec![500]);
    let id = TransactionId::from(BRANCH);
    assert_eq!(h.controller.server_transaction(&id).unwrap().state(), State::Completed);
}

#[test]
fn test_non_invite_sends_100_only_when_tu_is_slow() {
    let mut h = Harness::new();
    h.receive(wire_request(Method::Options, "z9hG4bKnit1"), PEER);
    h.tu_sip();

    h.advance(Duration::from_millis(3400));
    assert_eq!(h.wire.sent_count(), 0);
    h.advance(Duration::from_millis(100));
    assert_eq!(sent_codes(&h), vec![100]);
}

#[test]
fn test_non_invite_final_response_absorbs_retransmissions() {
    let mut h = Harness::new();
    h.receive(wire_request(Method::Options, "z9hG4bKnit2"), PEER);
    let request = h.tu_sip().remove(0);
    h.send(make_response(&request, 200, None));
    assert_eq!(sent_codes(&h), vec![200]);

    h.receive(wire_request(Method::Options, "z9hG4bKnit2"), PEER);
    assert_eq!(sent_codes(&h), vec![200]);
    assert!(h.tu_sip().is_empty());

    // Timer J is 64*T1
    h.advance(Duration::from_secs(32));
    assert_eq!(h.controller.server_count(), 0);
}

#[test]
fn test_cancel_matches_pending_invite() {
    let mut h = Harness::new();
    incoming_invite(&mut h);

    h.receive(wire_request(Method::Cancel, BRANCH), PEER);
    let to_tu = h.tu_sip();
    assert_eq!(to_tu.len(), 1);
    assert_eq!(*to_tu[0].method(), Method::Cancel);
    assert_eq!(h.controller.server_count(), 2);

    h.send(make_response(&to_tu[0], 200, None));
    let sent = h.wire.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.cseq.method, Method::Cancel);
    assert_eq!(sent[0].1.status_code(), Some(200));
}

#[test]
fn test_cancel_without_invite_gets_481() {
    let mut h = Harness::new();
    h.receive(wire_request(Method::Cancel, "z9hG4bKnothing"), PEER);
    assert_eq!(sent_codes(&h), vec![481]);
    assert!(h.tu_sip().is_empty());
    assert_eq!(h.controller.server_count(), 0);
}

#[test]
fn test_invalid_request_rejected_statelessly() {
    let mut h = Harness::new();
    let mut request = wire_request(Method::Options, "z9hG4bKbad");
    request.invalid_reason = Some("bad Max-Forwards".into());
    h.receive(request, PEER);

    let sent = h.wire.take_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0].1.start {
        StartLine::Response { code, reason } => {
            assert_eq!(*code, 400);
            assert_eq!(reason, "Bad Request (bad Max-Forwards)");
        }
        other => panic!("expected a response, got {:?}", other),
    }
    assert_eq!(h.controller.server_count(), 0);
}

#[test]
fn test_overloaded_queue_rejects_new_requests() {
    let config = StackConfig::default().with_fifo_limits(FifoLimits {
        reject_new_work_depth: 1,
        reject_non_essential_depth: 0,
    });
    let mut h = Harness::with_config(config);
    h.fifo
        .add(TransactionMessage::ConnectionTerminated(peer_tuple()))
        .unwrap();

    h.receive(wire_request(Method::Invite, "z9hG4bKbusy"), PEER);

    let sent = h.wire.take_sent();
    assert_eq!(sent.len(), 1);
    let response = &sent[0].1;
    assert_eq!(response.status_code(), Some(503));
    let retry_after = response.retry_after.unwrap();
    assert!((32..64).contains(&retry_after));
    assert_eq!(h.controller.server_count(), 0);
    assert!(h.tu_sip().is_empty());
}

#[test]
fn test_request_without_matching_tu_gets_500() {
    let mut h = Harness::new();
    let filter = MessageFilter::any().with_method(Method::Options);
    let mut tu = h
        .controller
        .register_transaction_user(TuId(1), TuRegistration::new("options").with_filter(filter));

    h.receive(wire_request(Method::Invite, "z9hG4bKnotu"), PEER);
    assert_eq!(sent_codes(&h), vec![500]);

    h.receive(wire_request(Method::Options, "z9hG4bKopt"), PEER);
    match tu.try_recv() {
        Some(TuMessage::Sip(msg)) => {
            assert_eq!(*msg.method(), Method::Options);
            assert_eq!(msg.tu, Some(TuId(1)));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.tu_sip().is_empty());
}

#[test]
fn test_tu_notified_of_termination() {
    let mut h = Harness::new();
    let mut tu = h
        .controller
        .register_transaction_user(TuId(7), TuRegistration::new("uas").with_transaction_termination());

    h.receive(wire_request(Method::Options, "z9hG4bKterm"), PEER);
    let request = match tu.try_recv() {
        Some(TuMessage::Sip(msg)) => msg,
        other => panic!("unexpected {:?}", other),
    };
    h.send(make_response(&request, 200, None));
    h.advance(Duration::from_secs(32));

    match tu.try_recv() {
        Some(TuMessage::TransactionTerminated { transaction_id, is_client }) => {
            assert_eq!(transaction_id, TransactionId::from("z9hG4bKterm"));
            assert!(!is_client);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_response_uses_source_port_with_rport() {
    let mut h = Harness::new();
    let mut request = wire_request(Method::Options, "z9hG4bKrport");
    request.vias[0].rport = true;
    h.receive(request, "127.0.0.1:40000");
    let request = h.tu_sip().remove(0);

    h.send(make_response(&request, 200, None));
    let sent = h.wire.take_sent();
    assert_eq!(sent[0].0.port(), 40000);
}

#[test]
fn test_reliable_invite_ends_on_ack() {
    let mut h = Harness::reliable();
    let invite = incoming_invite(&mut h);
    h.send(make_response(&invite, 486, None));
    assert_eq!(sent_codes(&h), vec![486]);

    h.advance(Duration::from_secs(2));
    assert_eq!(h.wire.sent_count(), 0, "no Timer G over TCP");

    h.receive(wire_request(Method::Ack, BRANCH), PEER);
    assert!(h.controller.server_transaction(&TransactionId::from(BRANCH)).is_none());
    assert!(h.tu_sip().is_empty());
}

#[test]
fn test_reliable_non_invite_ends_on_final_response() {
    let mut h = Harness::reliable();
    h.receive(wire_request(Method::Options, "z9hG4bKnit3"), PEER);
    let request = h.tu_sip().remove(0);
    h.send(make_response(&request, 200, None));
    assert_eq!(sent_codes(&h), vec![200]);
    assert_eq!(h.controller.server_count(), 0, "no Timer J over TCP");
}
