//! On-wire conformance: byte layouts and protocol scenarios that a
//! foreign implementation would have to match.

use qdt_core::error::Error;
use qdt_core::fragment::{parse_fragment_header, write_fragment_header, FRAG_HEADER_LEN};
use qdt_core::ipam::Pool;
use qdt_core::wire::{
    append_header, parse_header, Header, MsgType, HEADER_LEN, MAGIC, PROTOCOL_VERSION,
};
use qdt_crypto::ReplayWindow;
use std::net::Ipv4Addr;

#[test]
fn header_is_22_bytes_and_round_trips() {
    let h = Header {
        version: PROTOCOL_VERSION,
        msg_type: MsgType::Data,
        flags: 1,
        session_id: 42,
        counter: 7,
    };
    let mut buf = Vec::new();
    append_header(&mut buf, &h);
    buf.extend_from_slice(b"test");
    assert_eq!(buf.len(), 26);

    let (parsed, rest) = parse_header(&buf).unwrap();
    assert_eq!(parsed, h);
    assert_eq!(rest, b"test");
}

#[test]
fn header_field_offsets() {
    let mut buf = Vec::new();
    append_header(
        &mut buf,
        &Header {
            version: PROTOCOL_VERSION,
            msg_type: MsgType::Fragment,
            flags: 0xAB,
            session_id: 0x1122334455667788,
            counter: 0x99AABBCCDDEEFF00,
        },
    );
    assert_eq!(&buf[0..3], MAGIC);
    assert_eq!(buf[3], 1);
    assert_eq!(buf[4], 1); // Fragment
    assert_eq!(buf[5], 0xAB);
    assert_eq!(&buf[6..14], &0x1122334455667788u64.to_be_bytes());
    assert_eq!(&buf[14..22], &0x99AABBCCDDEEFF00u64.to_be_bytes());
    assert_eq!(buf.len(), HEADER_LEN);
}

#[test]
fn corrupting_the_magic_fails_parse() {
    let mut buf = Vec::new();
    append_header(&mut buf, &Header::new(MsgType::Data, 1, 1));
    buf[0] = b'X';
    assert!(matches!(parse_header(&buf), Err(Error::BadMagic)));
}

#[test]
fn fragment_subheader_layout() {
    let mut b = vec![0u8; FRAG_HEADER_LEN];
    write_fragment_header(&mut b, 0x01020304, 0x05060708, 0x090A0B0C);
    assert_eq!(b, [1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0A, 0x0B, 0x0C]);

    b.extend_from_slice(b"data");
    let (id, offset, total, payload) = parse_fragment_header(&b).unwrap();
    assert_eq!((id, offset, total), (0x01020304, 0x05060708, 0x090A0B0C));
    assert_eq!(payload, b"data");
}

#[test]
fn replay_window_scenario() {
    let w = ReplayWindow::new(4);
    assert!(w.check(1));
    w.mark(1);
    assert!(!w.check(1));
    w.mark(2);
    assert!(w.check(3));
    w.mark(10);
    assert!(!w.check(5));
}

#[test]
fn ipam_scenario_slash29() {
    let pool = Pool::new("10.8.0.0/29".parse().unwrap(), &[Ipv4Addr::new(10, 8, 0, 1)]).unwrap();
    let expected = [
        Ipv4Addr::new(10, 8, 0, 2),
        Ipv4Addr::new(10, 8, 0, 3),
        Ipv4Addr::new(10, 8, 0, 4),
        Ipv4Addr::new(10, 8, 0, 5),
        Ipv4Addr::new(10, 8, 0, 6),
    ];
    for want in expected {
        assert_eq!(pool.acquire().unwrap(), want);
    }
    assert!(matches!(pool.acquire(), Err(Error::PoolExhausted)));
}
