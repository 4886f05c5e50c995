use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustacord::{
    VoiceError,
    common::types::{GuildId, SessionId, UserId},
    configs::VoiceConfig,
    voice::{EncryptionMode, IterSource, PlaybackEnd, VoiceConnection, VoiceServerInfo},
};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use xsalsa20poly1305::{
    XSalsa20Poly1305,
    aead::{AeadInPlace, KeyInit},
};

type ServerSocket = WebSocketStream<TcpStream>;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SECRET_KEY: [u8; 32] = [7u8; 32];
const SSRC: u32 = 4242;

fn server_info(endpoint: String) -> VoiceServerInfo {
    VoiceServerInfo {
        guild_id: GuildId(41771983423143937),
        user_id: UserId(104694319306248192),
        session_id: SessionId::from("voice-session"),
        token: "voice-token".into(),
        endpoint,
    }
}

async fn send(ws: &mut ServerSocket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next client frame that is not a heartbeat; `None` once the socket closes.
async fn recv(ws: &mut ServerSocket) -> Option<Value> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["op"] != 3 {
                    return Some(frame);
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Answers the discovery request with the sender's own address.
async fn answer_discovery(udp: &UdpSocket) {
    let mut buf = [0u8; 74];
    let (n, from) = udp.recv_from(&mut buf).await.unwrap();
    assert_eq!(n, 74);
    assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), SSRC);

    let mut reply = [0u8; 74];
    reply[0..2].copy_from_slice(&2u16.to_be_bytes());
    reply[2..4].copy_from_slice(&70u16.to_be_bytes());
    reply[4..8].copy_from_slice(&SSRC.to_be_bytes());
    let address = from.ip().to_string();
    reply[8..8 + address.len()].copy_from_slice(address.as_bytes());
    reply[72..74].copy_from_slice(&from.port().to_be_bytes());
    udp.send_to(&reply, from).await.unwrap();
}

/// Runs the server half of the handshake and returns the selected mode.
///
/// The description answers with `answer_mode`, or the selected mode.
async fn negotiate(ws: &mut ServerSocket, udp: &UdpSocket, answer_mode: Option<&str>) -> String {
    let identify = recv(ws).await.unwrap();
    assert_eq!(identify["op"], 0);
    assert_eq!(identify["d"]["server_id"], "41771983423143937");
    assert_eq!(identify["d"]["token"], "voice-token");

    send(ws, json!({"op": 8, "d": {"heartbeat_interval": 13750.25}})).await;
    send(
        ws,
        json!({"op": 2, "d": {
            "ssrc": SSRC,
            "ip": "127.0.0.1",
            "port": udp.local_addr().unwrap().port(),
            "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_lite"],
        }}),
    )
    .await;
    answer_discovery(udp).await;

    let select = recv(ws).await.unwrap();
    assert_eq!(select["op"], 1);
    assert_eq!(select["d"]["protocol"], "udp");
    assert_eq!(select["d"]["data"]["address"], "127.0.0.1");
    let mode = select["d"]["data"]["mode"].as_str().unwrap().to_string();

    send(
        ws,
        json!({"op": 4, "d": {
            "mode": answer_mode.unwrap_or(&mode),
            "secret_key": SECRET_KEY.to_vec(),
        }}),
    )
    .await;
    mode
}

fn open_lite(packet: &[u8]) -> Vec<u8> {
    let trailer = packet.len() - 4;
    let mut nonce = [0u8; 24];
    nonce[..4].copy_from_slice(&packet[trailer..]);
    let tag = xsalsa20poly1305::Tag::clone_from_slice(&packet[12..28]);
    let mut body = packet[28..trailer].to_vec();
    XSalsa20Poly1305::new_from_slice(&SECRET_KEY)
        .unwrap()
        .decrypt_in_place_detached(&nonce.into(), b"", &mut body, &tag)
        .unwrap();
    body
}

#[tokio::test]
async fn negotiates_and_streams_encrypted_frames() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mode = negotiate(&mut ws, &udp, None).await;

            let mut speaking = Vec::new();
            while let Some(frame) = recv(&mut ws).await {
                if frame["op"] == 5 {
                    assert_eq!(frame["d"]["ssrc"], SSRC);
                    speaking.push(frame["d"]["speaking"].as_bool().unwrap());
                }
            }

            let mut packets = Vec::new();
            let mut buf = [0u8; 1500];
            while let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(200), udp.recv(&mut buf)).await
            {
                packets.push(buf[..n].to_vec());
            }
            (mode, speaking, packets)
        });

        let connection = VoiceConnection::connect(server_info(endpoint), VoiceConfig::default())
            .await
            .unwrap();
        assert_eq!(connection.ssrc(), SSRC);
        assert!(connection.is_open());

        let frames = (0u8..3).map(|i| Bytes::from(vec![0xAA, i]));
        let playback = connection.play(IterSource::new(frames)).await.unwrap();
        assert_eq!(playback.finished().await, PlaybackEnd::EndOfStream);
        connection.destroy().await;

        let (mode, speaking, packets) = server.await.unwrap();
        assert_eq!(mode, "xsalsa20_poly1305_lite");
        assert_eq!(speaking, vec![true, false]);

        // Three audio frames followed by five silence frames.
        assert_eq!(packets.len(), 8);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(&packet[..2], &[0x80, 0x78]);
            assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), i as u16);
            assert_eq!(
                u32::from_be_bytes(packet[4..8].try_into().unwrap()),
                960 * i as u32
            );
            assert_eq!(u32::from_be_bytes(packet[8..12].try_into().unwrap()), SSRC);
            assert_eq!(&packet[packet.len() - 4..], &(i as u32).to_be_bytes());
        }
        assert_eq!(open_lite(&packets[0]), vec![0xAA, 0]);
        assert_eq!(open_lite(&packets[2]), vec![0xAA, 2]);
        assert_eq!(open_lite(&packets[7]), vec![0xF8, 0xFF, 0xFE]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn unanswered_ready_times_out() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let identify = recv(&mut ws).await.unwrap();
            assert_eq!(identify["op"], 0);
            // Hold the socket open without answering.
            while recv(&mut ws).await.is_some() {}
        });

        let config = VoiceConfig {
            ready_timeout_ms: Some(100),
            ..VoiceConfig::default()
        };
        let err = VoiceConnection::connect(server_info(endpoint), config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VoiceError::HandshakeTimeout("voice ready")));
        server.abort();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn refuses_to_connect_without_encryption_modes() {
    let config = VoiceConfig {
        encryption_modes: Vec::new(),
        ..VoiceConfig::default()
    };
    let err = VoiceConnection::connect(server_info("ws://127.0.0.1:9".into()), config)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, VoiceError::EncryptionUnavailable(_)));
}

#[tokio::test]
async fn description_mode_wins_over_the_selected_one() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let selected = negotiate(&mut ws, &udp, Some("xsalsa20_poly1305_suffix")).await;
            while recv(&mut ws).await.is_some() {}
            selected
        });

        let connection = VoiceConnection::connect(server_info(endpoint), VoiceConfig::default())
            .await
            .unwrap();
        assert_eq!(connection.mode(), EncryptionMode::Suffix);
        connection.destroy().await;
        assert_eq!(server.await.unwrap(), "xsalsa20_poly1305_lite");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn hello_without_interval_fails_and_closes_the_socket() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            assert_eq!(recv(&mut ws).await.unwrap()["op"], 0);
            send(&mut ws, json!({"op": 8, "d": {}})).await;
            // The client tears the socket down rather than idling.
            assert!(recv(&mut ws).await.is_none());
        });

        let err = VoiceConnection::connect(server_info(endpoint), VoiceConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VoiceError::Malformed(_)));
        server.await.unwrap();
    })
    .await
    .unwrap();
}
