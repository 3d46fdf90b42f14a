mod common;

use common::Recorder;
use vendbus::bus;
use vendbus::event::{truncated_id, Event, Key};
use vendbus::link::{LinkError, LinkHandler};
use vendbus::orchestrator::{Orchestrator, Step};
use vendbus::protocol::{
    classify, validate_outbound, FramingError, Inbound, LineAssembler, Outbound, Reason, MAX_LINE_LEN,
};
use vendbus::state::StateView;
use vendbus::supervision::{ErrorKind, SupervisionNotifier};
use vendbus::MachineState;

fn link(recorder: &Recorder) -> (LinkHandler, bus::EventReceiver) {
    let (publisher, receiver) = bus::channel(16);
    let handler = LinkHandler::new(1000, publisher, StateView::new(), Box::new(recorder.clone()));
    (handler, receiver)
}

/// Link and orchestrator sharing one state view. Events are handed from the
/// bus to the orchestrator by [`deliver`].
fn linked_machine(recorder: &Recorder) -> (LinkHandler, bus::EventReceiver, Orchestrator) {
    let view = StateView::new();
    let (publisher, receiver) = bus::channel(16);
    let handler = LinkHandler::new(1000, publisher, view.clone(), Box::new(recorder.clone()));
    (handler, receiver, common::orchestrator(recorder, &view))
}

fn deliver(receiver: &mut bus::EventReceiver, orch: &mut Orchestrator) {
    while let Some(event) = receiver.try_consume() {
        if let Step::Hold { then, .. } = orch.handle_event(event) {
            orch.finish(then);
        }
    }
}

#[test]
fn test_inbound_line_table() {
    let cases: &[(&str, Option<Event>)] = &[
        ("NFC_UID:04A1B2C3", Some(Event::PaymentOk)),
        ("NFC_ERR:READ_FAILED", Some(Event::PaymentCancel)),
        ("NAK:STATE:PAYING:NO_NET", Some(Event::NoNetwork)),
        ("NAK:PAYMENT:DENIED", Some(Event::PaymentCancel)),
        ("ORDER_START:ORD-42", Some(Event::OrderStart(truncated_id("ORD-42")))),
        (
            "VEND 3 2 WATER",
            Some(Event::VendItem { slot: 3, qty: 2, product_id: truncated_id("WATER") }),
        ),
        ("ORDER_END", Some(Event::OrderComplete)),
        ("QR_TOKEN_ERROR", Some(Event::OrderFailed)),
        ("QR_TOKEN_INVALID", Some(Event::OrderFailed)),
        ("QR_TOKEN_BUSY", Some(Event::OrderFailed)),
        ("QR_TOKEN_NO_NETWORK", Some(Event::OrderFailed)),
        ("ORDER_FAILED", Some(Event::OrderFailed)),
        ("HELLO", None),
        ("QR_TOKEN_EXPIRED", None),
    ];
    for (line, expected) in cases {
        assert_eq!(classify(line).event(), *expected, "{line}");
    }
}

#[test]
fn test_order_start_without_id_is_malformed() {
    assert_eq!(classify("ORDER_START:"), Inbound::Malformed);
}

#[test]
fn test_long_ids_are_truncated() {
    let line = format!("ORDER_START:{}", "X".repeat(60));
    match classify(&line) {
        Inbound::OrderStart(id) => assert_eq!(id.len(), 31),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_tail_of_overlong_line_is_dropped() {
    let mut assembler = LineAssembler::new(1000);
    let mut bytes = vec![b'A'; MAX_LINE_LEN + 10];
    bytes.extend_from_slice(b"\r\nORDER_END\r\n");

    let mut lines = Vec::new();
    let mut errors = Vec::new();
    for byte in bytes {
        match assembler.push(byte, 0) {
            Ok(line) => lines.push(line.to_string()),
            Err(nb::Error::Other(e)) => errors.push(e),
            Err(nb::Error::WouldBlock) => {}
        }
    }
    assert_eq!(lines, vec!["ORDER_END"]);
    assert_eq!(errors, vec![FramingError::Overflow]);
}

#[test]
fn test_lf_only_and_blank_lines() {
    let mut assembler = LineAssembler::new(1000);
    let lines: Vec<String> = b"\r\n\nORDER_END\nORDER_FAILED\r\n"
        .iter()
        .filter_map(|b| assembler.push(*b, 5).ok())
        .map(|l| l.to_string())
        .collect();
    assert_eq!(lines, vec!["ORDER_END", "ORDER_FAILED"]);
}

#[test]
fn test_vend_without_session_is_rejected() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver) = link(&recorder);

    let published = handler.feed(b"VEND 5 1 X\r\n", 0);
    assert!(published.is_empty());
    assert_eq!(receiver.try_consume(), None);
    assert_eq!(recorder.outbound(), vec!["ORDER_NAK:NO_ACTIVE_ORDER"]);
}

#[test]
fn test_vend_after_network_revert_is_rejected() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver, mut orch) = linked_machine(&recorder);

    handler.handle_line("ORDER_START:R1");
    deliver(&mut receiver, &mut orch);
    assert_eq!(orch.state(), MachineState::Delivering);
    assert!(handler.session_open());

    // The order is dropped on the machine side, no ORDER_END ever arrives
    handler.handle_line("NAK:STATE:PAYING:NO_NET");
    deliver(&mut receiver, &mut orch);
    assert_eq!(orch.state(), MachineState::Idle);
    assert!(!handler.session_open());

    recorder.clear();
    assert_eq!(handler.handle_line("VEND 5 1 X"), None);
    assert_eq!(handler.handle_line("VEND 2 1 X"), None);
    assert_eq!(receiver.try_consume(), None);
    assert_eq!(
        recorder.outbound(),
        vec!["ORDER_NAK:NO_ACTIVE_ORDER", "ORDER_NAK:NO_ACTIVE_ORDER"]
    );
}

#[test]
fn test_vend_after_motor_abort_is_rejected() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver, mut orch) = linked_machine(&recorder);

    handler.handle_line("ORDER_START:R2");
    deliver(&mut receiver, &mut orch);
    if let Step::Hold { then, .. } = orch.handle_event(Event::MotorError) {
        orch.finish(then);
    }
    assert!(orch.active_order().is_none());

    recorder.clear();
    assert_eq!(handler.handle_line("VEND 1 1 X"), None);
    assert_eq!(receiver.try_consume(), None);
    assert_eq!(recorder.outbound(), vec!["ORDER_NAK:NO_ACTIVE_ORDER"]);
}

#[test]
fn test_vend_after_rejected_order_start_is_rejected() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver, mut orch) = linked_machine(&recorder);
    orch.handle_event(Event::Keypad(Key::Digit(1)));
    orch.handle_event(Event::Keypad(Key::Digit(2)));
    assert_eq!(orch.state(), MachineState::Paying);

    handler.handle_line("ORDER_START:R3");
    assert!(handler.session_open());
    deliver(&mut receiver, &mut orch);
    assert!(recorder.outbound().contains(&"ORDER_NAK:ORDER_ALREADY_ACTIVE".to_string()));
    assert!(!handler.session_open());

    recorder.clear();
    assert_eq!(handler.handle_line("VEND 2 1 X"), None);
    assert_eq!(receiver.try_consume(), None);
    assert_eq!(recorder.outbound(), vec!["ORDER_NAK:NO_ACTIVE_ORDER"]);

    // Still closed once the keypad order is gone
    orch.handle_event(Event::Keypad(Key::Star));
    recorder.clear();
    assert_eq!(handler.handle_line("VEND 2 1 X"), None);
    assert_eq!(recorder.outbound(), vec!["ORDER_NAK:NO_ACTIVE_ORDER"]);
}

#[test]
fn test_order_start_dropped_by_full_bus_opens_no_session() {
    let recorder = Recorder::default();
    let (publisher, mut receiver) = bus::channel(1);
    publisher.publish(Event::StockLow { sensor_id: 1, distance_mm: 180 }).unwrap();
    let mut handler = LinkHandler::new(1000, publisher, StateView::new(), Box::new(recorder.clone()));

    assert_eq!(handler.handle_line("ORDER_START:R4"), None);
    assert!(!handler.session_open());
    assert_eq!(handler.handle_line("VEND 2 1 X"), None);
    assert_eq!(recorder.outbound(), vec!["ORDER_NAK:NO_ACTIVE_ORDER"]);
    assert_eq!(receiver.try_consume(), Some(Event::StockLow { sensor_id: 1, distance_mm: 180 }));
    assert_eq!(receiver.try_consume(), None);
}

#[test]
fn test_vend_queued_behind_order_start_is_accepted() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver, mut orch) = linked_machine(&recorder);

    handler.handle_line("ORDER_START:R5");
    let vend = handler.handle_line("VEND 2 1 X");
    assert!(matches!(vend, Some(Event::VendItem { slot: 2, qty: 1, .. })));

    deliver(&mut receiver, &mut orch);
    assert_eq!(recorder.outbound(), vec!["ORDER_ACK", "VEND_COMPLETED:2"]);
    assert!(handler.session_open());
}

#[test]
fn test_vend_range_checks_inside_session() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver) = link(&recorder);
    handler.handle_line("ORDER_START:S1");
    assert_eq!(receiver.try_consume(), Some(Event::OrderStart(truncated_id("S1"))));

    assert_eq!(handler.handle_line("VEND 5 1 X"), None);
    assert_eq!(handler.handle_line("VEND 2 0 X"), None);
    assert_eq!(handler.handle_line("VEND 2 11 X"), None);
    assert_eq!(receiver.try_consume(), None);
    assert_eq!(
        recorder.outbound(),
        vec!["ORDER_NAK:INVALID_SLOT", "ORDER_NAK:INVALID_QTY", "ORDER_NAK:INVALID_QTY"]
    );

    let event = handler.handle_line("VEND 4 10 X");
    assert!(matches!(event, Some(Event::VendItem { slot: 4, qty: 10, .. })));
}

#[test]
fn test_malformed_vend_fails_open_session() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver) = link(&recorder);
    handler.handle_line("ORDER_START:S2");
    receiver.try_consume();

    assert_eq!(handler.handle_line("VEND two 1 X"), Some(Event::OrderFailed));
    assert_eq!(receiver.try_consume(), Some(Event::OrderFailed));
    assert!(!handler.session_open());
    assert_eq!(recorder.outbound(), vec!["ORDER_NAK:MALFORMED"]);
}

#[test]
fn test_malformed_vend_without_session_only_naks() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver) = link(&recorder);
    assert_eq!(handler.handle_line("VEND 1"), None);
    assert_eq!(receiver.try_consume(), None);
    assert_eq!(recorder.outbound(), vec!["ORDER_NAK:MALFORMED"]);
}

#[test]
fn test_unknown_lines_publish_nothing() {
    let recorder = Recorder::default();
    let (mut handler, mut receiver) = link(&recorder);
    assert!(handler.feed(b"PING\r\nSTATUS?\r\n", 0).is_empty());
    assert_eq!(receiver.try_consume(), None);
    assert!(recorder.outbound().is_empty());
}

#[test]
fn test_split_delivery_across_reads() {
    let recorder = Recorder::default();
    let (mut handler, _receiver) = link(&recorder);
    assert!(handler.feed(b"NFC_U", 0).is_empty());
    assert!(handler.feed(b"ID:04", 400).is_empty());
    assert_eq!(handler.feed(b"\r\n", 800), vec![Event::PaymentOk]);

    // A pause longer than the inter-byte timeout drops the fragment
    assert!(handler.feed(b"ORDER_", 1000).is_empty());
    assert!(handler.feed(b"END\r\n", 2500).is_empty());
    assert_eq!(handler.discarded_lines(), 1);
}

#[test]
fn test_outbound_lines() {
    let lines = [
        (Outbound::OrderAck, "ORDER_ACK"),
        (Outbound::OrderNak(Reason::NoActiveOrder), "ORDER_NAK:NO_ACTIVE_ORDER"),
        (Outbound::VendCompleted { slot: 1 }, "VEND_COMPLETED:1"),
        (Outbound::DeliveryCompleted, "DELIVERY_COMPLETED"),
        (Outbound::DeliveryFailed(Reason::MotorError), "DELIVERY_FAILED:MOTOR_ERROR"),
        (Outbound::StatePaying, "STATE:PAYING"),
    ];
    for (line, text) in lines {
        assert_eq!(line.encode().unwrap().as_str(), text);
    }
}

#[test]
fn test_outbound_validation() {
    assert_eq!(validate_outbound("ORDER_ACK"), Ok(()));
    assert_eq!(validate_outbound("BAD\tLINE"), Err(LinkError::InvalidChar(b'\t')));
    assert_eq!(validate_outbound(&"A".repeat(256)), Err(LinkError::TooLong));
    assert_eq!(
        Outbound::SupervisionError("x".repeat(300)).encode(),
        Err(LinkError::TooLong)
    );
}

#[test]
fn test_worst_case_supervision_line_fits() {
    let mut notifier = SupervisionNotifier::new(&"M".repeat(40), 0);
    let message = "\"\\".repeat(100);
    let line = notifier.prepare(ErrorKind::CriticalServiceFailure, &message, u64::MAX).unwrap();
    let encoded = line.encode().unwrap();
    assert!(encoded.starts_with("SUPERVISION_ERROR:{\"error_id\":\"err_"));
}
