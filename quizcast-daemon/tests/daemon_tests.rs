use quizcast_daemon::{listener, ControlServer, QuizFile};
use quizcast_hub::{GuardConfig, HubConfig, LatencyConfig, LiveSystem, SystemConfig};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::watch;

const QUIZ: &str = r#"
[[questions]]
type = "choice"
text = "Largest planet?"
choices = ["Mars", "Jupiter", "Venus"]
correct = 2

[[users]]
id = 10
name = "Ada"
"#;

fn start_system() -> Arc<LiveSystem> {
    let config = SystemConfig {
        hub: HubConfig {
            initial_sync_delay_ms: 10,
            ..HubConfig::default()
        },
        latency: LatencyConfig {
            enabled: false,
            ..LatencyConfig::default()
        },
        guard: GuardConfig {
            enabled: false,
            ..GuardConfig::default()
        },
        ..SystemConfig::default()
    };
    let collaborators = QuizFile::parse(QUIZ).unwrap().into_collaborators();
    LiveSystem::start(config, collaborators).unwrap()
}

async fn send_command(socket: &Path, command: &str) -> String {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    stream.write_all(command.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .expect("timed out waiting for control reply")
        .unwrap();
    response
}

async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .expect("stream closed");
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_tcp_client_receives_initial_sync() {
    let system = start_system();
    let (quit_tx, quit_rx) = watch::channel(false);

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let accept = tokio::spawn(listener::run(tcp, system.clone(), quit_rx));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let hello = json!({ "type": "hello", "data": { "role": "participant", "user_id": 10 } });
    write_half
        .write_all(format!("{}\n", hello).as_bytes())
        .await
        .unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let sync = loop {
        let frame = read_frame(&mut lines).await;
        if frame["type"] == "initial_sync" {
            break frame;
        }
    };
    assert_eq!(sync["data"]["event_state"], "waiting");
    assert_eq!(sync["data"]["question_number"], 0);

    quit_tx.send(true).unwrap();
    accept.await.unwrap();
    system.shutdown().await;
}

#[tokio::test]
async fn test_control_socket_drives_the_quiz() {
    let dir = tempdir().unwrap();
    let socket = dir.path().join("quizcast.sock");
    let system = start_system();
    let (quit_tx, mut quit_rx) = watch::channel(false);

    let server = ControlServer::new(&socket, system.clone(), quit_tx.clone()).unwrap();
    assert_eq!(server.socket_path(), socket.as_path());
    let serving = tokio::spawn(server.run(quit_rx.clone()));

    let reply: Value = serde_json::from_str(&send_command(&socket, "transition started").await).unwrap();
    assert_eq!(reply["event_state"], "started");

    let reply: Value = serde_json::from_str(&send_command(&socket, "next").await).unwrap();
    assert_eq!(reply["question_number"], 1);

    let status: Value = serde_json::from_str(&send_command(&socket, "status").await).unwrap();
    assert_eq!(status["event_state"], "question_active");
    assert_eq!(status["total_questions"], 1);

    let reply = send_command(&socket, "transition finished").await;
    assert!(reply.starts_with("Error:"), "unexpected reply: {}", reply);

    let reply = send_command(&socket, "dance").await;
    assert!(reply.starts_with("Error: Unknown command"));

    let reply = send_command(&socket, "sync 10").await;
    assert!(reply.contains("user 10"));

    let reply = send_command(&socket, "quit").await;
    assert!(reply.starts_with("Shutting down"));
    tokio::time::timeout(Duration::from_secs(2), quit_rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(*quit_rx.borrow());

    serving.await.unwrap();
    assert!(!socket.exists());
    system.shutdown().await;
}
