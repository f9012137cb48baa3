//! Unit tests for Frame, Headers and FrameBuilder.

use bytes::Bytes;
use stomp_relay::{Command, Frame, FrameError, header};

/// Builder pre-loaded with every mandatory header of `command`.
fn complete(command: Command) -> stomp_relay::FrameBuilder {
    command
        .mandatory_headers()
        .iter()
        .fold(Frame::builder(command), |b, name| b.header(*name, "v"))
}

// =============================================================================
// Mandatory Header Tests
// =============================================================================

#[test]
fn every_command_builds_with_its_mandatory_headers() {
    for command in Command::ALL {
        let frame = complete(command).build();
        assert!(frame.is_ok(), "{} failed: {:?}", command, frame);
    }
}

#[test]
fn every_missing_mandatory_header_is_rejected() {
    for command in Command::ALL {
        for missing in command.mandatory_headers() {
            let builder = command
                .mandatory_headers()
                .iter()
                .filter(|name| *name != missing)
                .fold(Frame::builder(command), |b, name| b.header(*name, "v"));
            assert_eq!(
                builder.build(),
                Err(FrameError::MissingHeader {
                    command,
                    header: *missing,
                }),
                "{} without {}",
                command,
                missing
            );
        }
    }
}

#[test]
fn mandatory_header_table() {
    assert_eq!(Command::Ack.mandatory_headers(), &[header::ID]);
    assert_eq!(
        Command::Connect.mandatory_headers(),
        &[header::ACCEPT_VERSION, header::HOST]
    );
    assert_eq!(
        Command::Message.mandatory_headers(),
        &[header::DESTINATION, header::MESSAGE_ID]
    );
    assert_eq!(
        Command::Subscribe.mandatory_headers(),
        &[header::DESTINATION, header::ID]
    );
    assert!(Command::Disconnect.mandatory_headers().is_empty());
}

// =============================================================================
// Body Tests
// =============================================================================

#[test]
fn body_only_for_commands_that_carry_one() {
    for command in Command::ALL {
        let result = complete(command).body("x").build();
        if command.has_body() {
            assert!(result.is_ok(), "{} should accept a body", command);
        } else {
            assert_eq!(result, Err(FrameError::BodyNotAllowed(command)));
        }
    }
}

#[test]
fn empty_body_is_no_body() {
    let frame = complete(Command::Send).body("").build().unwrap();
    assert!(frame.body().is_none());
}

#[test]
fn nul_in_body_derives_content_length() {
    let frame = complete(Command::Send)
        .body(Bytes::from_static(b"a\0b"))
        .build()
        .unwrap();
    assert_eq!(frame.content_length(), Some(3));
}

#[test]
fn text_body_has_no_content_length() {
    let frame = complete(Command::Send).body("plain").build().unwrap();
    assert_eq!(frame.content_length(), None);
}

#[test]
fn mismatched_content_length_is_rejected() {
    let result = complete(Command::Send)
        .header(header::CONTENT_LENGTH, "10")
        .body("short")
        .build();
    assert!(matches!(
        result,
        Err(FrameError::InvalidContentLength { actual: 5, .. })
    ));
}

// =============================================================================
// Header Tests
// =============================================================================

#[test]
fn headers_are_case_insensitive_and_ordered() {
    let frame = complete(Command::Send)
        .header("Z-Custom", "z")
        .header("a-custom", "a")
        .build()
        .unwrap();
    assert_eq!(frame.header("z-custom"), Some("z"));
    assert_eq!(frame.header("DESTINATION"), Some("v"));
    let names: Vec<_> = frame.headers().iter().map(|(k, _)| k).collect();
    assert_eq!(names, vec!["destination", "Z-Custom", "a-custom"]);
}

#[test]
fn repeated_header_keeps_values_in_order() {
    let frame = complete(Command::Send)
        .header("x-list", "1")
        .header("X-LIST", "2")
        .build()
        .unwrap();
    assert_eq!(frame.header("x-list"), Some("1"));
    assert_eq!(frame.headers().get_all("x-list"), vec!["1", "2"]);
    let wire: Vec<_> = frame.headers().wire_iter().collect();
    assert_eq!(wire[1], ("x-list", "1,2".to_string()));
}

#[test]
fn header_equality_uses_wire_form() {
    let a = complete(Command::Send).header("k", "1,2").build().unwrap();
    let b = complete(Command::Send)
        .header("K", "1")
        .header("k", "2")
        .build()
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn set_header_replaces_values() {
    let frame = complete(Command::Send)
        .header("k", "1")
        .header("k", "2")
        .set_header("k", "3")
        .build()
        .unwrap();
    assert_eq!(frame.headers().get_all("k"), vec!["3"]);
}

// =============================================================================
// Heartbeat and Accessor Tests
// =============================================================================

#[test]
fn heartbeat_is_empty() {
    let hb = Frame::heartbeat();
    assert!(hb.is_heartbeat());
    assert_eq!(hb.command(), None);
    assert!(hb.headers().is_empty());
    assert!(hb.body().is_none());
    assert!(hb.to_builder().is_none());
}

#[test]
fn accessors_read_well_known_headers() {
    let frame = Frame::builder(Command::Send)
        .destination("/queue/a")
        .receipt("r-1")
        .session("s-1")
        .header(header::TRANSACTION, "tx")
        .build()
        .unwrap();
    assert_eq!(frame.destination(), Some("/queue/a"));
    assert_eq!(frame.receipt(), Some("r-1"));
    assert_eq!(frame.session(), Some("s-1"));
    assert_eq!(frame.transaction(), Some("tx"));
}

#[test]
fn to_builder_round_trips() {
    let frame = complete(Command::Send).body("x").build().unwrap();
    let copy = frame.to_builder().unwrap().build().unwrap();
    assert_eq!(frame, copy);
}

#[test]
fn display_shows_command_headers_and_body_size() {
    let frame = complete(Command::Send)
        .header("content-type", "text/plain")
        .body("hello")
        .build()
        .unwrap();
    let s = format!("{}", frame);
    assert!(s.contains("Command: SEND"));
    assert!(s.contains("content-type: text/plain"));
    assert!(s.contains("Body (5 bytes)"));
    assert_eq!(format!("{}", Frame::heartbeat()), "Heartbeat\n");
}

// =============================================================================
// Command Catalog Tests
// =============================================================================

#[test]
fn command_capabilities() {
    let server: Vec<_> = Command::ALL
        .iter()
        .filter(|c| c.is_server_originated())
        .map(|c| c.as_str())
        .collect();
    assert_eq!(server, vec!["CONNECTED", "ERROR", "MESSAGE", "RECEIPT"]);
    assert!(Command::Subscribe.has_destination());
    assert!(Command::Unsubscribe.has_subscription_id());
    assert!(Command::Abort.is_transactional());
    assert!(!Command::Ack.is_transactional());
    assert_eq!("NACK".parse::<Command>().unwrap(), Command::Nack);
    assert!("send".parse::<Command>().is_err());
}
