use natpunch::protocol::{
    parse_client_id, parse_registration, split_pair, Flag, Packet, ProtocolError, HEADER_SIZE,
    PROTOCOL_VERSION,
};

#[test]
fn test_packet_roundtrip() {
    let packet = Packet::new(
        Flag::RelayData,
        40000,
        5001,
        b"alice|hello there".to_vec(),
    );

    let bytes = packet.encode();
    assert_eq!(bytes.len(), HEADER_SIZE + packet.payload.len());

    let parsed = Packet::decode(&bytes).unwrap();
    assert_eq!(parsed, packet);
}

#[test]
fn test_roundtrip_every_flag() {
    for flag in [
        Flag::Registration,
        Flag::UdpRegistration,
        Flag::RelayData,
        Flag::Heartbeat,
        Flag::PunchThroughRequest,
    ] {
        let packet = Packet::new(flag, 1, 2, b"payload".to_vec());
        let parsed = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(parsed.flag(), Some(flag));
        assert_eq!(parsed.payload, b"payload");
    }
}

#[test]
fn test_empty_payload_roundtrip() {
    let packet = Packet::new(Flag::Heartbeat, 0, 0, Vec::new());
    let bytes = packet.encode();
    assert_eq!(bytes.len(), HEADER_SIZE);

    let parsed = Packet::decode(&bytes).unwrap();
    assert!(parsed.payload.is_empty());
}

#[test]
fn test_header_layout_is_big_endian() {
    let packet = Packet::new(Flag::UdpRegistration, 0x01020304, 0x05060708, b"ab".to_vec());
    let bytes = packet.encode();

    assert_eq!(bytes[0], 0x02);
    assert_eq!(bytes[1], PROTOCOL_VERSION);
    assert_eq!(&bytes[2..6], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&bytes[6..10], &[0x05, 0x06, 0x07, 0x08]);
    assert_eq!(&bytes[10..14], &[0x00, 0x00, 0x00, 0x02]);
    assert_eq!(&bytes[14..], b"ab");
}

#[test]
fn test_short_buffer_is_malformed_header() {
    for len in 0..HEADER_SIZE {
        let buf = vec![0u8; len];
        match Packet::decode(&buf) {
            Err(ProtocolError::MalformedHeader { got }) => assert_eq!(got, len),
            other => panic!("expected MalformedHeader for len {len}, got {other:?}"),
        }
    }
}

#[test]
fn test_declared_length_past_end_is_truncated() {
    let mut bytes = Packet::new(Flag::RelayData, 1, 2, b"full payload".to_vec()).encode();
    bytes.truncate(HEADER_SIZE + 4);

    match Packet::decode(&bytes) {
        Err(ProtocolError::TruncatedPayload {
            declared,
            available,
        }) => {
            assert_eq!(declared, b"full payload".len());
            assert_eq!(available, 4);
        }
        other => panic!("expected TruncatedPayload, got {other:?}"),
    }
}

#[test]
fn test_version_mismatch_is_rejected() {
    let mut bytes = Packet::new(Flag::Heartbeat, 0, 0, b"x".to_vec()).encode();
    bytes[1] = 0x02;

    match Packet::decode(&bytes) {
        Err(ProtocolError::UnsupportedVersion { got }) => assert_eq!(got, 0x02),
        other => panic!("expected UnsupportedVersion, got {other:?}"),
    }
}

#[test]
fn test_unknown_flag_still_decodes() {
    let mut bytes = Packet::new(Flag::Heartbeat, 7, 9, b"data".to_vec()).encode();
    bytes[0] = 0x7f;

    let parsed = Packet::decode(&bytes).unwrap();
    assert_eq!(parsed.flag, 0x7f);
    assert_eq!(parsed.flag(), None);
    assert_eq!(parsed.payload, b"data");
}

#[test]
fn test_flag_from_u8() {
    assert_eq!(Flag::from_u8(0x01), Some(Flag::Registration));
    assert_eq!(Flag::from_u8(0x02), Some(Flag::UdpRegistration));
    assert_eq!(Flag::from_u8(0x03), Some(Flag::RelayData));
    assert_eq!(Flag::from_u8(0x04), Some(Flag::Heartbeat));
    assert_eq!(Flag::from_u8(0x06), Some(Flag::PunchThroughRequest));
    assert_eq!(Flag::from_u8(0x05), None);
    assert_eq!(Flag::from_u8(0xff), None);
}

#[test]
fn test_split_pair() {
    assert_eq!(split_pair(b"alice|hello"), Some(("alice", "hello")));
    // only the first delimiter splits; the rest is content
    assert_eq!(split_pair(b"alice|a|b|c"), Some(("alice", "a|b|c")));
    assert_eq!(split_pair(b"alice|"), Some(("alice", "")));
    assert_eq!(split_pair(b"no delimiter"), None);
    assert_eq!(split_pair(b"|empty id"), None);
    assert_eq!(split_pair(&[0xff, 0xfe, b'|', b'x']), None);
}

#[test]
fn test_parse_registration() {
    assert_eq!(
        parse_registration(b"carol|5005"),
        Some(("carol".to_string(), 5005))
    );
    assert_eq!(parse_registration(b"carol|not-a-port"), None);
    assert_eq!(parse_registration(b"carol|99999"), None);
    assert_eq!(parse_registration(b"carol"), None);
    assert_eq!(parse_registration(b""), None);
}

#[test]
fn test_parse_client_id() {
    assert_eq!(parse_client_id(b"alice"), Some("alice"));
    assert_eq!(parse_client_id(b""), None);
    assert_eq!(parse_client_id(&[0xff, 0xfe]), None);
}
