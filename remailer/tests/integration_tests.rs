//! Integration tests for remailer
//!
//! Packets are built with the public API and walked through relay
//! processors holding the fixture keys, the way a real network would.

use std::collections::HashMap;

use libmix_crypto::PrivateKey;
use rand::{Rng, RngCore};
use remailer::fragment::{FragmentPacket, FragmentParams};
use remailer::relay::{Delivery, RelayAction, RelayProcessor};
use remailer::*;

const RELAY_PEMS: [&str; 4] = [
    include_str!("fixtures/relay1.pem"),
    include_str!("fixtures/relay2.pem"),
    include_str!("fixtures/relay3.pem"),
    include_str!("fixtures/relay4.pem"),
];

const TLS_ROOT_PEM: &str = include_str!("fixtures/tls_root.pem");
const TLS_SERVER_PEM: &str = include_str!("fixtures/tls_server.pem");

fn relay_key(i: usize) -> PrivateKey {
    PrivateKey::from_pkcs1_pem(RELAY_PEMS[i]).unwrap()
}

fn directory() -> DescriptorList {
    DescriptorList::from_descriptors((0..4).map(|i| {
        let key = relay_key(i).public_key();
        RoutingDescriptor::new(format!("relay{}", i), format!("mix{}.example.net", i), 48099, key.clone(), Some(key))
            .unwrap()
            .with_exit(true)
            .with_fragmented(true)
    }))
}

fn recipients() -> Vec<String> {
    vec!["bob@example.org".to_string()]
}

fn random_message(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// The relays of [`directory`], keyed by host. Fragment pools persist
/// across packets so an exit can reassemble.
struct Network {
    relays: HashMap<String, RelayProcessor>,
}

impl Network {
    fn new() -> Self {
        let relays = (0..4)
            .map(|i| (format!("mix{}.example.net", i), RelayProcessor::new(relay_key(i))))
            .collect();
        Self { relays }
    }

    /// Forward `packet` until a relay delivers it; returns the delivery and hop count
    fn route(&self, first_host: &str, mut packet: Vec<u8>) -> (Delivery, usize) {
        let mut host = first_host.to_string();
        for hops in 1..=2 * MAX_HOPS {
            let relay = &self.relays[&host];
            match relay.process(&packet).unwrap() {
                RelayAction::Forward { route, packet: next } => {
                    assert_eq!(next.len(), PACKET_SIZE);
                    host = route.host;
                    packet = next;
                }
                RelayAction::Deliver { exit, payload } => {
                    return (relay.deliver(exit, &payload).unwrap(), hops);
                }
            }
        }
        panic!("packet never delivered");
    }
}

mod packet_tests {
    use super::*;

    #[test]
    fn test_three_hop_packet_shape() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 3).unwrap();

        let first = assembler.assemble_message(b"Subject: hi\n\nhello", &recipients()).unwrap();
        let second = assembler.assemble_message(b"Subject: hi\n\nhello", &recipients()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].bytes.len(), PACKET_SIZE);
        assert_eq!(second[0].bytes.len(), PACKET_SIZE);

        // fresh secrets and padding every time
        assert_ne!(first[0].bytes[..HEADER_LEN], second[0].bytes[..HEADER_LEN]);
    }

    #[test]
    fn test_forward_walk_delivers_plaintext() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 4).unwrap();
        let packets = assembler.assemble_message(b"Subject: walk\n\nfour hops", &recipients()).unwrap();

        let network = Network::new();
        let (delivery, hops) = network.route(packets[0].first_hop.host(), packets[0].bytes.clone());
        assert_eq!(hops, 4);
        match delivery {
            Delivery::Message { exit, body } => {
                assert_eq!(body, b"Subject: walk\n\nfour hops");
                assert!(matches!(exit, ExitInformation::Smtp { ref address, .. } if address == "bob@example.org"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fragmented_walk_reassembles_at_exit() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 2).unwrap();
        let message = random_message(60_000);
        let packets = assembler.assemble_message(&message, &recipients()).unwrap();
        assert!(packets.len() > 1);

        let network = Network::new();
        let mut delivered = None;
        for packet in &packets {
            match network.route(packet.first_hop.host(), packet.bytes.clone()).0 {
                Delivery::FragmentPending | Delivery::FragmentIgnored => {}
                Delivery::Message { exit, body } => {
                    assert!(delivered.is_none(), "reassembled twice");
                    delivered = Some((exit, body));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        let (exit, body) = delivered.expect("message reassembled");
        assert_eq!(body, message);
        assert!(matches!(exit, ExitInformation::Smtp { .. }));
    }
}

mod fragment_tests {
    use super::*;

    #[test]
    fn test_reassemble_after_dropping_redundant_shares() {
        let message = random_message(100 * 1024);
        let exit = ExitInformation::Smtp { tag: [0x11; 20], address: "bob@example.org".into() };
        let payloads = FragmentEngine::fragment(&message, &exit).unwrap();

        let first = FragmentPacket::parse(&payloads[0]).unwrap();
        let params = FragmentParams::for_len(first.total_size as usize);
        assert_eq!(payloads.len(), params.total_fragments());

        // drop exactly n - k shares from every group
        let mut rng = rand::thread_rng();
        let mut kept = Vec::new();
        for g in 0..params.groups {
            let dropped = rand::seq::index::sample(&mut rng, params.n, params.n - params.k).into_vec();
            for j in (0..params.n).filter(|j| !dropped.contains(j)) {
                kept.push(&payloads[g * params.n + j]);
            }
        }
        assert_eq!(kept.len(), params.groups * params.k);

        let pool = FragmentPool::new();
        let mut result = None;
        for payload in kept {
            let packet = FragmentPacket::parse(payload).unwrap();
            if let Some(done) = pool.add_and_reassemble(&packet).unwrap() {
                result = Some(done);
            }
        }

        let (got_exit, body) = result.expect("message reassembled");
        assert_eq!(got_exit, exit);
        assert_eq!(body, message);
    }

    #[test]
    fn test_exit_relay_reassembles_fragments() {
        let message = random_message(70_000);
        let payloads = FragmentEngine::fragment(&message, &ExitInformation::Fragmented).unwrap();
        let relay = RelayProcessor::new(relay_key(2));

        let mut outcomes = Vec::new();
        for payload in payloads.iter().rev() {
            outcomes.push(relay.deliver(ExitInformation::Fragmented, payload).unwrap());
        }

        // shares past the k-th of each group are ignored, not stored again
        let params = FragmentParams::for_len(FragmentPacket::parse(&payloads[0]).unwrap().total_size as usize);
        let ignored = outcomes.iter().filter(|d| **d == Delivery::FragmentIgnored).count();
        assert_eq!(ignored, params.groups * (params.n - params.k));
        assert!(relay.fragments().is_empty());

        let messages: Vec<_> = outcomes
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Message { body, .. } => Some(body),
                Delivery::FragmentPending | Delivery::FragmentIgnored => None,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(messages, vec![message]);
    }
}

mod directory_tests {
    use super::*;

    #[test]
    fn test_descriptor_without_packet_key_rejected() {
        let key = relay_key(0).public_key();
        let desc = RoutingDescriptor::new("relay0", "mix0.example.net", 48099, key.clone(), Some(key))
            .unwrap();
        let text = desc.to_text().unwrap();
        assert!(RoutingDescriptor::parse(&text).is_ok());

        let stripped: String = text
            .lines()
            .filter(|l| !l.starts_with("Packet-Key:"))
            .map(|l| format!("{}\n", l))
            .collect();
        let err = RoutingDescriptor::parse(&stripped).unwrap_err();
        assert!(err.is_parse_error());
    }

    #[test]
    fn test_directory_text_round_trip() {
        let dir = directory();
        let text: String = dir.descriptors().iter().map(|d| d.to_text().unwrap()).collect();
        let parsed = DescriptorList::parse(&text);
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed.exits().len(), 4);
        assert!(parsed.random_path_with_exit(3).unwrap().last().unwrap().is_exit());
    }
}

mod reply_tests {
    use super::*;

    #[test]
    fn test_reply_block_round_trip_through_relays() {
        let dir = directory();
        let mut keyring = Keyring::new();
        let secret = keyring.new_secret().unwrap();

        let path = dir.random_path_with_exit(3).unwrap();
        let block = ReplyBlock::build("alice@example.org", &path, &secret).unwrap();
        let armored = block.to_armored();

        // the correspondent only sees the armored text
        let blocks = ReplyBlock::parse_all(&armored).unwrap();
        let assembler = MessageAssembler::new(&dir, 2).unwrap();
        let packets = assembler.assemble_reply_message(b"Subject: re: hi\n\nthanks", &blocks).unwrap();
        assert_eq!(packets.len(), 1);

        let network = Network::new();
        let text = match network.route(packets[0].first_hop.host(), packets[0].bytes.clone()).0 {
            Delivery::Encrypted { exit, text } => {
                assert!(matches!(exit, ExitInformation::Smtp { ref address, .. } if address == "alice@example.org"));
                text
            }
            other => panic!("unexpected {:?}", other),
        };

        let decoder = ReplyDecoder::new(keyring);
        let decoded = decoder.decode(&format!("From: exit\n\n{}", text)).unwrap();
        assert_eq!(decoded, DecodedReply::Message(b"Subject: re: hi\n\nthanks".to_vec()));

        // a stranger's keyring cannot read it
        let mut other = Keyring::new();
        other.new_secret().unwrap();
        assert!(ReplyDecoder::new(other).decode(&text).is_err());
    }

    #[test]
    fn test_keyring_pack_and_wrong_password() {
        let mut keyring = Keyring::new();
        keyring.new_secret().unwrap();
        keyring.new_secret().unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let packed = keyring.pack("correct horse", now).unwrap();

        let unpacked = Keyring::unpack(&packed, "correct horse").unwrap();
        assert_eq!(unpacked.len(), 2);
        assert_eq!(unpacked.secrets()[0].secret(), keyring.secrets()[0].secret());

        assert!(matches!(Keyring::unpack(&packed, "battery staple"), Err(MixError::WrongPassword)));
    }
}

mod transport_tests {
    use super::*;
    use remailer::tls::{cert::public_key_from_pem, Certificate, CipherSuite};
    use tokio::io::duplex;

    fn root() -> PrivateKey {
        PrivateKey::from_pkcs1_pem(TLS_ROOT_PEM).unwrap()
    }

    fn relay_config(suites: Vec<CipherSuite>) -> TlsConfig {
        let key = PrivateKey::from_pkcs1_pem(TLS_SERVER_PEM).unwrap();
        let leaf = Certificate::issue("mix0.example.net", &key.public_key(), "root", &root()).unwrap();
        TlsConfig {
            cipher_suites: suites,
            identity: Some(TlsIdentity::new(key, vec![leaf]).unwrap()),
            ..TlsConfig::default()
        }
    }

    fn client_config(suites: Vec<CipherSuite>) -> TlsConfig {
        let root_pem = remailer::tls::cert::public_key_to_pem(&root().public_key()).unwrap();
        TlsConfig {
            cipher_suites: suites,
            check_root: true,
            trusted_root: Some(public_key_from_pem(&root_pem).unwrap()),
            ..TlsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disjoint_suites_fail_handshake() {
        let server = relay_config(vec![CipherSuite::DheRsaAes256CbcSha]);
        let client = client_config(vec![CipherSuite::DheRsaAes128CbcSha]);

        let (a, b) = duplex(1 << 17);
        let (client, server) = tokio::join!(
            TlsStream::connect(a, &client, CloseGuard::new()),
            TlsStream::accept(b, &server, CloseGuard::new())
        );

        let err = server.unwrap_err();
        assert!(matches!(&err, MixError::Protocol(msg) if msg == "no supported ciphersuite found"));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_relay_speaking_only_3des() {
        let (sink, mut received) = PacketSink::new(relay_config(vec![CipherSuite::DheRsa3desEdeCbcSha]), 8).unwrap();
        let (a, b) = duplex(1 << 17);
        let server = tokio::spawn(async move { sink.serve(b).await });

        // the default offer falls back to 3DES
        let config = client_config(TlsConfig::default().cipher_suites);
        let mut conn = MmtpConnection::initiate(a, &config, CloseGuard::new()).await.unwrap();
        let packet = vec![0x5Au8; PACKET_SIZE];
        assert!(conn.send(&packet, false).await.unwrap());
        conn.close().await;

        assert_eq!(server.await.unwrap().unwrap(), 1);
        assert_eq!(received.recv().await.unwrap(), packet);
    }

    #[tokio::test]
    async fn test_assembled_packet_reaches_sink() {
        let dir = directory();
        let assembler = MessageAssembler::new(&dir, 2).unwrap();
        let packet = assembler.assemble_message(b"over the wire", &recipients()).unwrap().remove(0);

        let suites = vec![CipherSuite::DheRsaAes128CbcSha, CipherSuite::DheRsaAes256CbcSha];
        let (sink, mut received) = PacketSink::new(relay_config(suites.clone()), 8).unwrap();
        let (a, b) = duplex(1 << 17);
        let server = tokio::spawn(async move { sink.serve(b).await });

        let client = MmtpClient::new(client_config(suites));
        assert!(client.send_over(a, &packet.bytes, false).await.unwrap());
        assert_eq!(server.await.unwrap().unwrap(), 1);

        let bytes = received.recv().await.unwrap();
        assert_eq!(bytes, packet.bytes);

        // the receiving relay can act on what arrived
        let (delivery, _) = Network::new().route(packet.first_hop.host(), bytes);
        assert!(matches!(delivery, Delivery::Message { ref body, .. } if body == b"over the wire"));
    }

    #[tokio::test]
    async fn test_multiple_packets_one_connection() {
        let (sink, mut received) = PacketSink::new(relay_config(vec![CipherSuite::DheRsaAes256CbcSha]), 8).unwrap();
        let (a, b) = duplex(1 << 17);
        let server = tokio::spawn(async move { sink.serve(b).await });

        let config = client_config(vec![CipherSuite::DheRsaAes256CbcSha]);
        let mut conn = MmtpConnection::initiate(a, &config, CloseGuard::new()).await.unwrap();
        let mut rng = rand::thread_rng();
        let packets: Vec<Vec<u8>> = (0..3).map(|_| (0..PACKET_SIZE).map(|_| rng.gen()).collect()).collect();
        for p in &packets {
            assert!(conn.send(p, false).await.unwrap());
        }
        assert!(conn.send(&packets[0], true).await.unwrap());
        conn.close().await;

        assert_eq!(server.await.unwrap().unwrap(), 3);
        for p in &packets {
            assert_eq!(&received.recv().await.unwrap(), p);
        }
    }
}
