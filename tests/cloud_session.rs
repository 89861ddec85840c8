//! End-to-end session tests against a scripted cloud on the loopback
//! interface: full TCP handshake, CoAP multiplexing, RPC dispatch, and the
//! chunked transfer protocol.

use std::sync::Arc;
use std::time::Duration;

use coap_lite::Packet;
use hmac::{Hmac, Mac};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::timeout;

use iotready_device::codec::{self, Method, Status};
use iotready_device::transport::chunker::{self, Reassembler};
use iotready_device::transport::cipher::{DecryptStream, EncryptStream};
use iotready_device::{
    AckPolicy, CloudOptions, DeviceClient, Event, FunctionFlags, PublishScope, SubscriptionScope,
    VariableKind, VariableValue,
};

const DEVICE_ID: &str = "000102030405060708090a0b";
const SESSION_MATERIAL: [u8; 40] = [0x02; 40];

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// The cloud side of one TCP session: handshake, cipher streams, helpers.
struct CloudSim {
    stream: TcpStream,
    encrypt: EncryptStream,
    decrypt: DecryptStream,
    reassembler: Reassembler,
}

impl CloudSim {
    async fn accept(listener: &TcpListener, server_key: &RsaPrivateKey) -> Self {
        let (mut stream, _) = listener.accept().await.unwrap();

        // Step 1: nonce out, encrypted identity back.
        let nonce = [0x01u8; 40];
        stream.write_all(&nonce).await.unwrap();

        let mut blocks = vec![0u8; 256];
        stream.read_exact(&mut blocks).await.unwrap();
        let payload: Vec<u8> = blocks
            .chunks(server_key.size())
            .flat_map(|b| server_key.decrypt(Pkcs1v15Encrypt, b).unwrap())
            .collect();
        assert_eq!(&payload[..40], &nonce);
        assert_eq!(&payload[40..52], &hex::decode(DEVICE_ID).unwrap()[..]);
        let device_public = RsaPublicKey::from_public_key_der(&payload[52..]).unwrap();

        // Step 2: session material under the device key, signed HMAC after.
        let mut rng = rand::thread_rng();
        let ciphertext = device_public
            .encrypt(&mut rng, Pkcs1v15Encrypt, &SESSION_MATERIAL)
            .unwrap();
        let mut mac = Hmac::<Sha1>::new_from_slice(&SESSION_MATERIAL).unwrap();
        mac.update(&ciphertext);
        let signature = server_key
            .sign(Pkcs1v15Sign::new_unprefixed(), &mac.finalize().into_bytes())
            .unwrap();
        stream.write_all(&ciphertext).await.unwrap();
        stream.write_all(&signature).await.unwrap();

        let key = [0x02u8; 16];
        let iv = [0x02u8; 16];
        Self {
            stream,
            encrypt: EncryptStream::new(key, iv),
            decrypt: DecryptStream::new(key, iv),
            reassembler: Reassembler::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let frame = codec::encode(packet).unwrap();
        let ciphertext = self.encrypt.encrypt(&frame);
        let framed = chunker::frame(&ciphertext).unwrap();
        self.stream.write_all(&framed).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        loop {
            if let Some(chunk) = self.reassembler.next_chunk() {
                let frame = self.decrypt.decrypt(&chunk).unwrap();
                return codec::decode(&frame).unwrap();
            }
            let mut buf = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("cloud sim timed out waiting for bytes")
                .unwrap();
            assert!(n > 0, "device closed the connection");
            self.reassembler.push(&buf[..n]);
        }
    }

    /// Wait for a frame matching the predicate, transparently answering the
    /// device's housekeeping traffic (hello, time sync, publishes, pings).
    async fn expect(&mut self, pred: impl Fn(&Packet) -> bool) -> Packet {
        for _ in 0..64 {
            let packet = self.recv().await;
            if pred(&packet) {
                return packet;
            }
            self.handle_housekeeping(&packet).await;
        }
        panic!("expected frame never arrived");
    }

    async fn handle_housekeeping(&mut self, packet: &Packet) {
        let path = codec::uri_path(packet);
        match path.first().map(String::as_str) {
            Some("h") => {
                self.send(&codec::ack_empty(packet.header.message_id)).await;
            }
            Some("t") => {
                self.send(&codec::ack_with(
                    Status::Content,
                    packet.header.message_id,
                    codec::token(packet),
                    0x6500_0000u32.to_be_bytes().to_vec(),
                ))
                .await;
            }
            Some("e") if codec::method(packet) == Some(Method::Get) => {
                // Subscription: plain ACK.
                self.send(&codec::ack_empty(packet.header.message_id)).await;
            }
            _ if codec::is_confirmable(packet) => {
                self.send(&codec::ack_empty(packet.header.message_id)).await;
            }
            _ => {}
        }
    }
}

async fn wait_event(
    events: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

fn tcp_client(port: u16, server_public_der: Vec<u8>, device_private_pem: String) -> DeviceClient {
    let mut client = DeviceClient::new(
        CloudOptions::new()
            .address("127.0.0.1")
            .port(port)
            .force_tcp(true)
            .server_public_key(server_public_der),
    );
    client
        .begin(DEVICE_ID, device_private_pem.as_bytes(), 9, 3, 6)
        .unwrap();
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_session_end_to_end() {
    let mut rng = StdRng::seed_from_u64(42);
    let device_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let server_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let device_pem = device_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
    let server_der = server_key
        .to_public_key()
        .to_public_key_der()
        .unwrap()
        .as_bytes()
        .to_vec();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = tcp_client(port, server_der, device_pem);

    // Registrations before connect.
    assert!(client.post(
        "add",
        Arc::new(|call: iotready_device::FunctionCall| {
            Box::pin(async move {
                let sum: i32 = call
                    .args
                    .split(',')
                    .filter_map(|v| v.parse::<i32>().ok())
                    .sum();
                Ok(sum * 14)
            })
        }),
        FunctionFlags::default(),
    ));
    assert!(client.get(
        "temp",
        VariableKind::Double,
        Arc::new(|_| Box::pin(async { Ok(VariableValue::Double(21.5)) })),
    ));
    assert!(client.file(
        "blob",
        "application/octet-stream",
        Arc::new(|_| Box::pin(async { Ok(b"file contents".to_vec()) })),
    ));
    assert!(client.subscribe(
        "weather",
        Arc::new(|_| {}),
        SubscriptionScope::MyDevices,
    ));

    let mut events = client.events().unwrap();
    client.connect().unwrap();

    let mut cloud = CloudSim::accept(&listener, &server_key).await;

    // Hello arrives first, with the session-material message id and the
    // 10-byte header plus the 12-byte device id.
    let hello = cloud.recv().await;
    assert_eq!(codec::uri_path(&hello), vec!["h".to_string()]);
    assert_eq!(hello.header.message_id, 0x0202);
    assert_eq!(hello.payload.len(), 22);
    assert_eq!(&hello.payload[..2], &9u16.to_be_bytes()); // product id
    assert_eq!(&hello.payload[2..4], &3u16.to_be_bytes()); // firmware version
    assert_eq!(&hello.payload[6..8], &6u16.to_be_bytes()); // platform id
    assert_eq!(&hello.payload[8..10], &12u16.to_be_bytes());
    assert_eq!(&hello.payload[10..], &hex::decode(DEVICE_ID).unwrap()[..]);
    cloud.send(&codec::ack_empty(hello.header.message_id)).await;

    wait_event(&mut events, |e| matches!(e, Event::Connected)).await;

    // The replayed subscription carries the MY_DEVICES query.
    let subscribe = cloud
        .expect(|p| {
            codec::uri_path(p) == vec!["e".to_string(), "weather".to_string()]
                && codec::method(p) == Some(Method::Get)
        })
        .await;
    assert_eq!(codec::uri_queries(&subscribe), vec![b"u".to_vec()]);
    cloud
        .send(&codec::ack_empty(subscribe.header.message_id))
        .await;
    wait_event(&mut events, |e| matches!(e, Event::Subscribe { .. })).await;

    // Time sync: answer the GetTime request, then observe the `time` event.
    let gettime = cloud
        .expect(|p| codec::uri_path(p) == vec!["t".to_string()])
        .await;
    cloud
        .send(&codec::ack_with(
            Status::Content,
            gettime.header.message_id,
            codec::token(&gettime),
            0x6500_0000u32.to_be_bytes().to_vec(),
        ))
        .await;
    wait_event(
        &mut events,
        |e| matches!(e, Event::Time { epoch_seconds } if *epoch_seconds == 0x6500_0000),
    )
    .await;

    // S2: empty confirmable ping is answered with an empty ACK.
    cloud.send(&codec::ping(7)).await;
    let pong = cloud
        .expect(|p| codec::is_ack(p) && p.header.message_id == 7)
        .await;
    assert!(codec::is_empty_code(&pong));

    // S3: function call returns the 32-bit big-endian result with the token.
    let call = codec::request(
        Method::Post,
        true,
        900,
        &["f", "add"],
        &[b"1,2".to_vec(), b"owner".to_vec()],
        vec![0xab],
        vec![],
    );
    cloud.send(&call).await;
    let result = cloud
        .expect(|p| codec::token(p) == vec![0xab] && !codec::is_ack(p))
        .await;
    assert_eq!(codec::code_byte(&result), 0x45); // 2.05
    assert_eq!(result.payload, vec![0, 0, 0, 42]);

    // Variable read encodes the declared double.
    let read = codec::request(Method::Get, true, 901, &["v", "temp"], &[], vec![0xcd], vec![]);
    cloud.send(&read).await;
    let value = cloud
        .expect(|p| codec::token(p) == vec![0xcd] && codec::is_ack(p))
        .await;
    assert_eq!(codec::code_byte(&value), 0x45);
    assert_eq!(value.payload, 21.5f64.to_be_bytes().to_vec());

    // Publish with ACK: completes once the cloud acknowledges.
    let publisher = {
        let name = "sensor/reading";
        client
            .publish_with(name, b"38".to_vec(), PublishScope::Public, AckPolicy::WithAck, None)
            .await
            .unwrap();
        name
    };
    let published = cloud
        .expect(|p| {
            codec::uri_path(p) == vec!["e".to_string(), "sensor".to_string(), "reading".to_string()]
        })
        .await;
    assert!(codec::is_confirmable(&published));
    cloud
        .send(&codec::ack_empty(published.header.message_id))
        .await;
    wait_event(
        &mut events,
        |e| matches!(e, Event::PublishCompleted { name, success } if name == publisher && *success),
    )
    .await;

    // S5: updates disabled refuses a 12-byte firmware UpdateBegin with 5.03.
    client.disable_updates();
    let mut fw_begin = vec![0u8; 12];
    fw_begin[3..7].copy_from_slice(&1000u32.to_be_bytes());
    cloud
        .send(&codec::request(
            Method::Post,
            true,
            910,
            &["u"],
            &[],
            vec![0x11],
            fw_begin,
        ))
        .await;
    let refusal = cloud
        .expect(|p| codec::is_ack(p) && p.header.message_id == 910)
        .await;
    assert_eq!(codec::code_byte(&refusal), 0xa3); // 5.03
    wait_event(&mut events, |e| matches!(e, Event::Error { .. })).await;
    client.enable_updates();

    // S4: named transfer with one corrupted chunk recovers via fast OTA.
    let chunk0 = vec![0x11u8; 256];
    let chunk1 = vec![0x22u8; 244];
    let mut begin = vec![0u8; 12];
    begin[3..7].copy_from_slice(&500u32.to_be_bytes());
    begin.push(4);
    begin.extend_from_slice(b"blob");
    cloud
        .send(&codec::request(
            Method::Post,
            true,
            920,
            &["u"],
            &[],
            vec![0x12],
            begin,
        ))
        .await;
    let ready = cloud
        .expect(|p| codec::is_ack(p) && p.header.message_id == 920)
        .await;
    assert_eq!(codec::code_byte(&ready), 0x44); // 2.04
    assert_eq!(ready.payload, vec![b'u']);

    let send_chunk = |crc: u32, index: u16, payload: Vec<u8>, id: u16| {
        codec::request(
            Method::Post,
            false,
            id,
            &["c"],
            &[crc.to_be_bytes().to_vec(), index.to_be_bytes().to_vec()],
            vec![],
            payload,
        )
    };
    cloud.send(&send_chunk(crc32(&chunk0), 0, chunk0.clone(), 921)).await;
    cloud.send(&send_chunk(0xdead_beef, 1, chunk1.clone(), 922)).await;

    cloud
        .send(&codec::request(Method::Put, true, 923, &["u"], &[], vec![0x13], vec![]))
        .await;
    let nack = cloud
        .expect(|p| codec::is_ack(p) && p.header.message_id == 923)
        .await;
    assert_eq!(codec::code_byte(&nack), 0x80); // 4.00

    let rerequest = cloud
        .expect(|p| codec::uri_path(p) == vec!["c".to_string()] && codec::method(p).is_some())
        .await;
    assert_eq!(rerequest.payload, vec![0x00, 0x01]);
    cloud
        .send(&codec::ack_empty(rerequest.header.message_id))
        .await;

    cloud.send(&send_chunk(crc32(&chunk1), 1, chunk1.clone(), 924)).await;
    cloud
        .send(&codec::request(Method::Put, true, 925, &["u"], &[], vec![0x14], vec![]))
        .await;
    let done = cloud
        .expect(|p| codec::is_ack(p) && p.header.message_id == 925)
        .await;
    assert_eq!(codec::code_byte(&done), 0x44); // 2.04

    let received = wait_event(&mut events, |e| matches!(e, Event::FileReceived { .. })).await;
    match received {
        Event::FileReceived { name, data } => {
            assert_eq!(name, "blob");
            assert_eq!(data.len(), 500);
            assert_eq!(&data[..256], &chunk0[..]);
            assert_eq!(&data[256..], &chunk1[..]);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Outbound file transfer: FileRequest drives the full chunk protocol.
    cloud
        .send(&codec::request(
            Method::Get,
            true,
            930,
            &["g", "blob"],
            &[],
            vec![0x15],
            vec![],
        ))
        .await;
    let accepted = cloud
        .expect(|p| codec::is_ack(p) && p.header.message_id == 930)
        .await;
    assert_eq!(codec::code_byte(&accepted), 0x44);
    assert_eq!(accepted.payload, vec![1]);

    let update_begin = cloud
        .expect(|p| {
            codec::uri_path(p) == vec!["u".to_string()] && codec::method(p) == Some(Method::Post)
        })
        .await;
    assert_eq!(update_begin.payload[0], 1); // fast OTA
    assert_eq!(
        u32::from_be_bytes(update_begin.payload[3..7].try_into().unwrap()),
        13 // "file contents"
    );
    cloud
        .send(&codec::ack_with(
            Status::Changed,
            update_begin.header.message_id,
            codec::token(&update_begin),
            vec![b'u'],
        ))
        .await;

    let chunk = cloud
        .expect(|p| codec::uri_path(p) == vec!["c".to_string()] && codec::method(p) == Some(Method::Post))
        .await;
    assert_eq!(chunk.payload.len(), 256); // zero-padded to the chunk size
    assert_eq!(&chunk.payload[..13], b"file contents");
    let queries = codec::uri_queries(&chunk);
    assert_eq!(queries[0], crc32(b"file contents").to_be_bytes().to_vec());
    assert_eq!(queries[1], vec![0, 0]);
    cloud.send(&codec::ack_empty(chunk.header.message_id)).await;

    let update_done = cloud
        .expect(|p| {
            codec::uri_path(p) == vec!["u".to_string()] && codec::method(p) == Some(Method::Put)
        })
        .await;
    cloud
        .send(&codec::ack_empty(update_done.header.message_id))
        .await;
    wait_event(
        &mut events,
        |e| matches!(e, Event::FileSent { name } if name == "blob"),
    )
    .await;

    // Owner gating end to end: the cloud asserts owners, then calls.
    assert!(client.post(
        "wipe",
        Arc::new(|_| Box::pin(async { Ok(1) })),
        FunctionFlags::owner_only(),
    ));
    cloud
        .send(&codec::request(
            Method::Post,
            false,
            940,
            &["E", "iotready", "device", "owners"],
            &[],
            vec![],
            b"owner".to_vec(),
        ))
        .await;
    cloud
        .send(&codec::request(
            Method::Post,
            true,
            941,
            &["f", "wipe"],
            &[b"".to_vec(), b"owner".to_vec()],
            vec![0x16],
            vec![],
        ))
        .await;
    let wiped = cloud
        .expect(|p| codec::token(p) == vec![0x16] && !codec::is_ack(p))
        .await;
    assert_eq!(codec::code_byte(&wiped), 0x45);

    // Disconnect latches: the session ends and does not come back.
    assert!(client.connected());
    client.disconnect();
    wait_event(&mut events, |e| matches!(e, Event::Disconnect)).await;
    assert!(!client.connected());
    // Idempotent: a second disconnect changes nothing observable.
    client.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!client.connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_session_speaks_plain_coap_datagrams() {
    let cloud = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = cloud.local_addr().unwrap().port();

    let mut client = DeviceClient::new(CloudOptions::new().address("127.0.0.1").port(port));
    client
        .begin(DEVICE_ID, &[0x30, 0x42, 0x02, 0x01], 1, 1, 6)
        .unwrap();
    let mut events = client.events().unwrap();
    client.connect().unwrap();

    // Hello arrives as one plaintext datagram.
    let mut buf = [0u8; 2048];
    let (n, device_addr) = timeout(Duration::from_secs(5), cloud.recv_from(&mut buf))
        .await
        .expect("no hello datagram")
        .unwrap();
    let hello = codec::decode(&buf[..n]).unwrap();
    assert_eq!(codec::uri_path(&hello), vec!["h".to_string()]);
    let ack = codec::encode(&codec::ack_empty(hello.header.message_id)).unwrap();
    cloud.send_to(&ack, device_addr).await.unwrap();

    wait_event(&mut events, |e| matches!(e, Event::Connected)).await;

    // S2 over UDP.
    let ping = codec::encode(&codec::ping(3)).unwrap();
    cloud.send_to(&ping, device_addr).await.unwrap();
    let pong = loop {
        let (n, _) = timeout(Duration::from_secs(5), cloud.recv_from(&mut buf))
            .await
            .expect("no pong datagram")
            .unwrap();
        let packet = codec::decode(&buf[..n]).unwrap();
        if codec::is_ack(&packet) && packet.header.message_id == 3 {
            break packet;
        }
        // Housekeeping (time sync, publishes): ack confirmables.
        if codec::is_confirmable(&packet) {
            let ack = codec::encode(&codec::ack_empty(packet.header.message_id)).unwrap();
            cloud.send_to(&ack, device_addr).await.unwrap();
        }
    };
    assert!(codec::is_empty_code(&pong));

    client.disconnect();
}
