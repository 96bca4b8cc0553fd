//! Cross-role key agreement: a client-sealed datagram opens under the
//! server's receive state and vice versa.

use qdt_crypto::{derive_key_material, CipherState, ReplayWindow, TAG_LEN};

fn fixed_nonces() -> ([u8; 16], [u8; 16]) {
    let mut client = [0u8; 16];
    let mut server = [0u8; 16];
    for i in 0..16 {
        client[i] = i as u8;
        server[i] = 100 + i as u8;
    }
    (client, server)
}

#[test]
fn client_to_server_roundtrip() {
    let (cn, sn) = fixed_nonces();
    let km = derive_key_material("secret", &cn, &sn).unwrap();
    let (client_send, _) = CipherState::client_pair(&km, ReplayWindow::new(128)).unwrap();
    let (_, server_recv) = CipherState::server_pair(&km, ReplayWindow::new(128)).unwrap();

    let counter = client_send.next_counter();
    let mut sealed = Vec::new();
    client_send
        .seal_into(&mut sealed, counter, b"header", b"payload")
        .unwrap();

    let plain = server_recv.open(counter, b"header", &sealed).unwrap();
    assert_eq!(plain, b"payload");
}

#[test]
fn server_to_client_roundtrip() {
    let (cn, sn) = fixed_nonces();
    let km = derive_key_material("secret", &cn, &sn).unwrap();
    let (server_send, _) = CipherState::server_pair(&km, ReplayWindow::new(128)).unwrap();
    let (_, client_recv) = CipherState::client_pair(&km, ReplayWindow::new(128)).unwrap();

    let counter = server_send.next_counter();
    let mut sealed = Vec::new();
    server_send
        .seal_into(&mut sealed, counter, b"aad", b"response")
        .unwrap();

    assert_eq!(client_recv.open(counter, b"aad", &sealed).unwrap(), b"response");
}

#[test]
fn every_counter_gets_a_distinct_ciphertext() {
    let (cn, sn) = fixed_nonces();
    let km = derive_key_material("secret", &cn, &sn).unwrap();
    let (send, _) = CipherState::client_pair(&km, ReplayWindow::new(128)).unwrap();

    let mut a = Vec::new();
    let mut b = Vec::new();
    send.seal_into(&mut a, send.next_counter(), b"aad", b"same payload")
        .unwrap();
    send.seal_into(&mut b, send.next_counter(), b"aad", b"same payload")
        .unwrap();
    assert_eq!(a.len(), b"same payload".len() + TAG_LEN);
    assert_ne!(a, b, "nonce must differ per counter");
}

#[test]
fn sealed_stream_survives_reordering_once() {
    let (cn, sn) = fixed_nonces();
    let km = derive_key_material("secret", &cn, &sn).unwrap();
    let (send, _) = CipherState::client_pair(&km, ReplayWindow::new(64)).unwrap();
    let (_, recv) = CipherState::server_pair(&km, ReplayWindow::new(64)).unwrap();

    let mut sealed = Vec::new();
    for i in 0u8..8 {
        let counter = send.next_counter();
        let mut buf = Vec::new();
        send.seal_into(&mut buf, counter, b"aad", &[i]).unwrap();
        sealed.push((counter, buf));
    }
    sealed.reverse();

    for (counter, buf) in &sealed {
        assert!(recv.open(*counter, b"aad", buf).is_ok());
    }
    for (counter, buf) in &sealed {
        assert!(recv.open(*counter, b"aad", buf).is_err(), "second delivery must fail");
    }
}
