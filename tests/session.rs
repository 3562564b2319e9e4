//! End-to-end runs of the inspection sequence against a scripted RTSP server
//! on localhost.
//!
//! The server speaks just enough RTSP/1.0 for one session: DESCRIBE, SETUP
//! over UDP or TCP interleaved, PLAY followed by a few RTP packets, OPTIONS
//! and TEARDOWN, optionally behind a Basic auth challenge. It returns the
//! requests it received, in order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use rtsp_inspect::client::{
    Client, MediaDescription, SessionDescription, SessionOptions, TransportPreference,
};
use rtsp_inspect::probe::{self, FatalError};
use rtsp_inspect::report::{self, Reporter};
use rtsp_inspect::rtp;

const SESSION_ID: &str = "12345678";

#[derive(Clone, Copy)]
struct Script {
    describe_fails: bool,
    /// Never answer DESCRIBE.
    stall_describe: bool,
    refuse_udp: bool,
    /// Answer 401 with a Basic challenge to requests without `Authorization`.
    require_auth: bool,
    session_timeout: u32,
    packets: u16,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            describe_fails: false,
            stall_describe: false,
            refuse_udp: false,
            require_auth: false,
            session_timeout: 60,
            packets: 0,
        }
    }
}

struct Request {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn methods(seen: &[Request]) -> Vec<&str> {
    seen.iter().map(|r| r.method.as_str()).collect()
}

async fn read_request<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Option<Request> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let mut request_line = line.split_whitespace();
    let method = request_line.next()?.to_owned();
    let uri = request_line.next()?.to_owned();
    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let l = line.trim_end();
        if l.is_empty() {
            break;
        }
        let (name, value) = l.split_once(':')?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
    Some(Request {
        method,
        uri,
        headers,
    })
}

fn sdp() -> String {
    [
        "v=0",
        "o=- 0 0 IN IP4 127.0.0.1",
        "s=Test Stream",
        "c=IN IP4 0.0.0.0",
        "t=0 0",
        "a=control:*",
        "m=video 0 RTP/AVP 96",
        "a=rtpmap:96 H264/90000",
        "a=fmtp:96 packetization-mode=1",
        "a=control:trackID=0",
        "",
    ]
    .join("\r\n")
}

fn rtp_packet(seq: u16) -> Vec<u8> {
    let mut p = vec![0x80, 0x60];
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&(u32::from(seq) * 3000).to_be_bytes());
    p.extend_from_slice(&0x0102_0304u32.to_be_bytes());
    p.extend_from_slice(&[0x65, 0x88, 0x84, 0x00]);
    p
}

/// Serves one connection according to `script` and returns every request
/// it received.
async fn serve(listener: TcpListener, script: Script) -> Vec<Request> {
    let port = listener.local_addr().unwrap().port();
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut seen = Vec::new();
    let mut udp_client_port = None;
    let mut interleaved = None;

    while let Some(req) = read_request(&mut reader).await {
        let cseq = req.header("CSeq").unwrap_or("0").to_owned();
        let method = req.method.clone();
        if script.require_auth && req.header("Authorization").is_none() {
            let reply = format!(
                "RTSP/1.0 401 Unauthorized\r\nCSeq: {}\r\n\
                 WWW-Authenticate: Basic realm=\"x\"\r\n\r\n",
                cseq
            );
            write.write_all(reply.as_bytes()).await.unwrap();
            seen.push(req);
            continue;
        }
        if method == "DESCRIBE" && script.stall_describe {
            seen.push(req);
            continue;
        }
        let reply = match method.as_str() {
            "DESCRIBE" if script.describe_fails => {
                format!("RTSP/1.0 404 Not Found\r\nCSeq: {}\r\n\r\n", cseq)
            }
            "DESCRIBE" => {
                let body = sdp();
                format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {}\r\n\
                     Content-Base: rtsp://127.0.0.1:{}/stream/\r\n\
                     Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
                    cseq,
                    port,
                    body.len(),
                    body
                )
            }
            "SETUP" => {
                let transport = req.header("Transport").unwrap_or_default().to_owned();
                if transport.starts_with("RTP/AVP/TCP") {
                    interleaved = Some(0u8);
                    format!(
                        "RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: {};timeout={}\r\n\
                         Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
                        cseq, SESSION_ID, script.session_timeout
                    )
                } else if script.refuse_udp {
                    format!("RTSP/1.0 461 Unsupported Transport\r\nCSeq: {}\r\n\r\n", cseq)
                } else {
                    let ports = transport
                        .split(';')
                        .find_map(|p| p.strip_prefix("client_port="))
                        .unwrap()
                        .to_owned();
                    let rtp_port: u16 = ports.split('-').next().unwrap().parse().unwrap();
                    udp_client_port = Some(rtp_port);
                    format!(
                        "RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: {};timeout={}\r\n\
                         Transport: RTP/AVP;unicast;client_port={};server_port=6970-6971\r\n\r\n",
                        cseq, SESSION_ID, script.session_timeout, ports
                    )
                }
            }
            "PLAY" => format!(
                "RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: {}\r\n\r\n",
                cseq, SESSION_ID
            ),
            _ => format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n\r\n", cseq),
        };
        write.write_all(reply.as_bytes()).await.unwrap();
        seen.push(req);

        match method.as_str() {
            "PLAY" => {
                if let Some(channel) = interleaved {
                    for seq in 0..script.packets {
                        let p = rtp_packet(seq);
                        let mut frame = vec![b'$', channel];
                        frame.extend_from_slice(&(p.len() as u16).to_be_bytes());
                        frame.extend_from_slice(&p);
                        write.write_all(&frame).await.unwrap();
                    }
                } else if let Some(client_port) = udp_client_port {
                    // Deliberately not the announced server_port.
                    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                    for seq in 0..script.packets {
                        socket
                            .send_to(&rtp_packet(seq), ("127.0.0.1", client_port))
                            .await
                            .unwrap();
                    }
                }
            }
            "TEARDOWN" => break,
            _ => {}
        }
    }
    seen
}

/// Binds the scripted server and returns the URL it serves.
async fn start(script: Script) -> (String, tokio::task::JoinHandle<Vec<Request>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("rtsp://127.0.0.1:{}/stream", listener.local_addr().unwrap().port());
    (url, tokio::spawn(serve(listener, script)))
}

enum Event {
    Description(SessionDescription),
    Packet { media: usize, json: String },
}

struct Recorder {
    events: Mutex<Vec<Event>>,
    want_packets: usize,
    done: CancellationToken,
}

impl Recorder {
    fn new(want_packets: usize, done: CancellationToken) -> Arc<Self> {
        Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
            want_packets,
            done,
        })
    }
}

impl Reporter for Recorder {
    fn description(&self, description: &SessionDescription) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Description(description.clone()));
    }

    fn packet(&self, media: &MediaDescription, packet: &rtp::Packet) {
        let mut events = self.events.lock().unwrap();
        events.push(Event::Packet {
            media: media.index,
            json: report::packet_json(packet).unwrap(),
        });
        let packets = events
            .iter()
            .filter(|e| matches!(e, Event::Packet { .. }))
            .count();
        if packets >= self.want_packets {
            self.done.cancel();
        }
    }
}

fn check_events(recorder: &Recorder, packets: usize) {
    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), packets + 1);
    let Event::Description(ref d) = events[0] else {
        panic!("description must come first");
    };
    assert_eq!(d.title.as_deref(), Some("Test Stream"));
    assert_eq!(d.medias.len(), 1);
    assert_eq!(d.medias[0].formats[0].encoding.as_deref(), Some("H264"));

    let mut seqs = Vec::new();
    for e in &events[1..] {
        let Event::Packet { media, ref json } = *e else {
            panic!("only one description expected");
        };
        assert_eq!(media, 0);
        let v: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(v.as_object().unwrap().len(), 11, "{}", json);
        assert_eq!(v["payload_type"], 96);
        assert_eq!(v["ssrc"], 0x0102_0304);
        seqs.push(v["sequence_number"].as_u64().unwrap());
    }
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), packets);
}

#[tokio::test]
async fn falls_back_to_interleaved_and_tears_down() {
    let (url, server) = start(Script {
        refuse_udp: true,
        packets: 3,
        ..Default::default()
    })
    .await;

    let shutdown = CancellationToken::new();
    let recorder = Recorder::new(3, shutdown.clone());
    tokio::time::timeout(
        Duration::from_secs(10),
        probe::run(&url, SessionOptions::default(), recorder.clone(), shutdown),
    )
    .await
    .unwrap()
    .unwrap();

    let seen = server.await.unwrap();
    assert_eq!(
        methods(&seen),
        ["DESCRIBE", "SETUP", "SETUP", "PLAY", "TEARDOWN"]
    );
    assert_eq!(seen[4].header("Session"), Some(SESSION_ID));
    check_events(&recorder, 3);
}

#[tokio::test]
async fn udp_accepts_any_server_port() {
    let (url, server) = start(Script {
        packets: 2,
        ..Default::default()
    })
    .await;

    let shutdown = CancellationToken::new();
    let recorder = Recorder::new(2, shutdown.clone());
    let options = SessionOptions::default().transport(TransportPreference::Udp);
    tokio::time::timeout(
        Duration::from_secs(10),
        probe::run(&url, options, recorder.clone(), shutdown),
    )
    .await
    .unwrap()
    .unwrap();

    let seen = server.await.unwrap();
    assert_eq!(methods(&seen), ["DESCRIBE", "SETUP", "PLAY", "TEARDOWN"]);
    check_events(&recorder, 2);
}

#[tokio::test]
async fn basic_auth_is_retried_and_kept() {
    let (url, server) = start(Script {
        require_auth: true,
        packets: 1,
        ..Default::default()
    })
    .await;
    let url = url.replace("rtsp://", "rtsp://user:pass@");

    let shutdown = CancellationToken::new();
    let recorder = Recorder::new(1, shutdown.clone());
    let options = SessionOptions::default().transport(TransportPreference::Tcp);
    tokio::time::timeout(
        Duration::from_secs(10),
        probe::run(&url, options, recorder.clone(), shutdown),
    )
    .await
    .unwrap()
    .unwrap();

    let seen = server.await.unwrap();
    assert_eq!(
        methods(&seen),
        ["DESCRIBE", "DESCRIBE", "SETUP", "PLAY", "TEARDOWN"]
    );
    assert_eq!(seen[0].header("Authorization"), None);
    assert_eq!(seen[0].header("CSeq"), Some("1"));
    assert_eq!(seen[1].header("CSeq"), Some("2"));
    for req in &seen[1..] {
        assert_eq!(
            req.header("Authorization"),
            Some("Basic dXNlcjpwYXNz"),
            "{} lacks credentials",
            req.method
        );
    }
    for req in &seen {
        assert!(!req.uri.contains("user"), "credentials leaked into {}", req.uri);
    }
    check_events(&recorder, 1);
}

#[tokio::test]
async fn auth_challenge_without_credentials_is_not_fatal() {
    let (url, server) = start(Script {
        require_auth: true,
        ..Default::default()
    })
    .await;
    let (parsed, _) = rtsp_inspect::client::parse_url(&url).unwrap();
    let mut client = Client::connect(&parsed, SessionOptions::default())
        .await
        .unwrap();
    let e = client.describe(&parsed).await.unwrap_err();
    assert_eq!(e.status(), Some(rtsp_types::StatusCode::Unauthorized));
    assert!(
        e.to_string()
            .contains("Authentication requested and no credentials supplied"),
        "{}",
        e
    );
    client.close().await;
    assert_eq!(methods(&server.await.unwrap()), ["DESCRIBE"]);

    let (url, server) = start(Script {
        require_auth: true,
        ..Default::default()
    })
    .await;
    let shutdown = CancellationToken::new();
    let recorder = Recorder::new(1, CancellationToken::new());
    let running = tokio::spawn({
        let recorder = recorder.clone();
        let shutdown = shutdown.clone();
        async move { probe::run(&url, SessionOptions::default(), recorder, shutdown).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!running.is_finished());
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(methods(&server.await.unwrap()), ["DESCRIBE"]);
    assert!(recorder.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn keepalive_carries_session_id() {
    let (url, server) = start(Script {
        session_timeout: 2,
        packets: 1,
        ..Default::default()
    })
    .await;

    // Never cancels on its own; the session has to outlive one keepalive period.
    let recorder = Recorder::new(usize::MAX, CancellationToken::new());
    let shutdown = CancellationToken::new();
    let options = SessionOptions::default().transport(TransportPreference::Tcp);
    let running = tokio::spawn({
        let recorder = recorder.clone();
        let shutdown = shutdown.clone();
        async move { probe::run(&url, options, recorder, shutdown).await }
    });
    tokio::time::sleep(Duration::from_millis(1600)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let seen = server.await.unwrap();
    let m = methods(&seen);
    assert_eq!(&m[..3], ["DESCRIBE", "SETUP", "PLAY"]);
    assert_eq!(m.last(), Some(&"TEARDOWN"));
    let options: Vec<&Request> = seen.iter().filter(|r| r.method == "OPTIONS").collect();
    assert!(!options.is_empty(), "no keepalive in {:?}", m);
    for req in options {
        assert_eq!(req.header("Session"), Some(SESSION_ID));
    }
    check_events(&recorder, 1);
}

#[tokio::test]
async fn describe_failure_keeps_running_until_cancelled() {
    let (url, server) = start(Script {
        describe_fails: true,
        ..Default::default()
    })
    .await;

    let shutdown = CancellationToken::new();
    let recorder = Recorder::new(1, CancellationToken::new());
    let running = tokio::spawn({
        let recorder = recorder.clone();
        let shutdown = shutdown.clone();
        async move { probe::run(&url, SessionOptions::default(), recorder, shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!running.is_finished());
    assert!(recorder.events.lock().unwrap().is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    // SETUP and PLAY fail locally: there is no media and no session.
    assert_eq!(methods(&server.await.unwrap()), ["DESCRIBE"]);
}

#[tokio::test]
async fn shutdown_interrupts_pending_describe() {
    let (url, server) = start(Script {
        stall_describe: true,
        ..Default::default()
    })
    .await;

    let shutdown = CancellationToken::new();
    let recorder = Recorder::new(1, CancellationToken::new());
    let options = SessionOptions::default().read_timeout(Duration::from_secs(30));
    let running = tokio::spawn({
        let recorder = recorder.clone();
        let shutdown = shutdown.clone();
        async move { probe::run(&url, options, recorder, shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(methods(&server.await.unwrap()), ["DESCRIBE"]);
    assert!(recorder.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn steps_out_of_order_fail_preconditions() {
    let (url, server) = start(Script::default()).await;

    let (url, _) = rtsp_inspect::client::parse_url(&url).unwrap();
    let mut client = Client::connect(&url, SessionOptions::default())
        .await
        .unwrap();
    let e = client.setup_all(None).await.unwrap_err();
    assert!(e.to_string().contains("no media to set up"), "{}", e);
    let e = client.play().await.unwrap_err();
    assert!(e.to_string().contains("must SETUP before PLAY"), "{}", e);
    assert_eq!(client.session_id(), None);
    client.close().await;

    assert!(server.await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_server_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("rtsp://127.0.0.1:{}/stream", listener.local_addr().unwrap().port());
    drop(listener);

    let recorder = Recorder::new(1, CancellationToken::new());
    let r = probe::run(
        &url,
        SessionOptions::default(),
        recorder.clone(),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(r, Err(FatalError::Connect(_))), "{:?}", r);
    assert!(recorder.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_urls_are_fatal_before_connecting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let urls = [
        "not a url".to_owned(),
        format!("http://127.0.0.1:{}/stream", port),
        "rtsp:/stream".to_owned(),
        // No scheme: the host is taken for one.
        format!("localhost:{}/stream", port),
    ];
    for url in &urls {
        let recorder = Recorder::new(1, CancellationToken::new());
        let r = probe::run(
            url,
            SessionOptions::default(),
            recorder.clone(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(r, Err(FatalError::MalformedUrl(_))), "{}: {:?}", url, r);
        assert!(recorder.events.lock().unwrap().is_empty());
    }
    let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(accepted.is_err(), "a malformed URL led to a connection");
}
