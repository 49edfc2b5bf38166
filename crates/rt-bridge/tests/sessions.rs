//! Session lifecycle tests
//!
//! Drive the dispatcher directly with decoded frames and a channel-backed
//! sink, against real `/bin/sh` processes on real PTYs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use rt_bridge::pty::{find_multiplexer, multiplexer_session_name};
use rt_bridge::{BridgeState, Dispatcher};
use rt_core::config::BridgeConfig;
use rt_core::{FrameSink, LinkError};
use rt_protocol::{ConnectionId, Message, TerminalSize};

const WAIT: Duration = Duration::from_secs(10);

/// Sink that hands every outbound frame to the test
struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&self, message: Message) -> Result<(), LinkError> {
        self.tx.send(message).map_err(|_| LinkError::Closed)
    }
}

struct Harness {
    dispatcher: Dispatcher,
    state: Arc<BridgeState>,
    frames: mpsc::UnboundedReceiver<Message>,
    _work_dir: TempDir,
}

fn harness(users: &[&str]) -> Harness {
    harness_with(users, None)
}

/// Sessions are persistent exactly when a multiplexer is given
fn harness_with(users: &[&str], multiplexer: Option<PathBuf>) -> Harness {
    let work_dir = TempDir::new().unwrap();
    let config = BridgeConfig {
        allowed_users: users.iter().map(|u| u.to_string()).collect(),
        device_name: Some("test-host".to_string()),
        work_dir: Some(work_dir.path().to_path_buf()),
        shell: Some("/bin/sh".to_string()),
        session_persistent: multiplexer.is_some(),
        env: [("PS1".to_string(), "$ ".to_string())].into_iter().collect(),
        close_grace: Duration::from_millis(300),
        ..Default::default()
    };

    let state = Arc::new(
        BridgeState::with_multiplexer(config, multiplexer, CancellationToken::new()).unwrap(),
    );
    let (tx, frames) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(state.clone(), Arc::new(ChannelSink { tx }));

    Harness {
        dispatcher,
        state,
        frames,
        _work_dir: work_dir,
    }
}

impl Harness {
    async fn send(&self, text: &str) {
        self.dispatcher.dispatch_text(text).await;
    }

    async fn connect(&self, id: &str, user: &str) {
        self.send(&format!(
            r#"{{"type":"client_connect","connection_id":"{}","auth_token":{{}},"telegram_user_id":"{}"}}"#,
            id, user
        ))
        .await;
    }

    async fn input(&self, id: &str, data: &str) {
        self.dispatcher
            .dispatch(Message::TerminalInput {
                connection_id: ConnectionId::new(id),
                data: data.to_string(),
            })
            .await;
    }

    /// Next frame that is not terminal output
    async fn next_control(&mut self) -> Message {
        loop {
            let frame = timeout(WAIT, self.frames.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("sink closed");
            if !matches!(frame, Message::TerminalOutput { .. }) {
                return frame;
            }
        }
    }

    /// Collect output for `id` until it contains `needle`; returns all
    /// output seen per connection
    async fn output_until(&mut self, id: &str, needle: &str) -> Vec<(String, String)> {
        let mut seen: Vec<(String, String)> = Vec::new();
        let mut for_id = String::new();

        while !for_id.contains(needle) {
            let frame = timeout(WAIT, self.frames.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?} on {}: {:?}", needle, id, seen))
                .expect("sink closed");

            if let Message::TerminalOutput {
                connection_id,
                data,
            } = frame
            {
                if connection_id.as_str() == id {
                    for_id.push_str(&data);
                }
                seen.push((connection_id.as_str().to_string(), data));
            }
        }
        seen
    }

    fn size_of(&self, id: &str) -> Option<TerminalSize> {
        self.state
            .sessions()
            .get(&ConnectionId::new(id))
            .and_then(|s| s.pty().size())
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_connect_input_output_disconnect() {
    let mut h = harness(&["42"]);

    h.connect("A", "42").await;
    match h.next_control().await {
        Message::ConnectionReady {
            connection_id,
            message,
        } => {
            assert_eq!(connection_id.as_str(), "A");
            assert_eq!(message, "connected to test-host");
        }
        other => panic!("Expected connection_ready, got {:?}", other),
    }

    h.input("A", "echo hi\n").await;
    h.output_until("A", "hi").await;

    let session = h.state.sessions().get(&ConnectionId::new("A")).unwrap();
    assert!(!session.is_persistent());

    h.send(r#"{"type":"client_disconnect","connection_id":"A"}"#).await;
    assert!(h.state.sessions().get(&ConnectionId::new("A")).is_none());

    let exit = timeout(WAIT, session.pty().wait_exit()).await.unwrap();
    assert!(exit.is_some());
    wait_until(|| session.pty().is_closed()).await;
}

#[tokio::test]
async fn test_unauthorized_user_gets_auth_failed() {
    let mut h = harness(&["42"]);

    h.connect("B", "7").await;
    match h.next_control().await {
        Message::AuthFailed { connection_id, .. } => assert_eq!(connection_id.as_str(), "B"),
        other => panic!("Expected auth_failed, got {:?}", other),
    }
    assert!(h.state.sessions().is_empty());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let mut h = harness(&["42", "43"]);

    h.connect("A", "42").await;
    h.next_control().await;
    h.connect("B", "43").await;
    h.next_control().await;

    h.input("A", "echo only_$((20 + 1))\n").await;
    let seen = h.output_until("A", "only_21").await;
    assert!(seen
        .iter()
        .all(|(id, data)| id == "A" || !data.contains("only_21")));

    h.input("B", "echo other_$((30 + 3))\n").await;
    let seen = h.output_until("B", "other_33").await;
    assert!(seen
        .iter()
        .all(|(id, data)| id == "B" || !data.contains("other_33")));

    h.state.close_all().await;
}

#[tokio::test]
async fn test_resize_applies_to_one_session() {
    let mut h = harness(&["42"]);

    h.connect("A", "42").await;
    h.next_control().await;
    h.connect("B", "42").await;
    h.next_control().await;

    h.send(r#"{"type":"terminal_resize","connection_id":"A","cols":120,"rows":40}"#)
        .await;

    assert_eq!(h.size_of("A"), Some(TerminalSize::new(120, 40)));
    assert_eq!(h.size_of("B"), Some(TerminalSize::new(80, 24)));

    h.input("A", "stty size\n").await;
    h.output_until("A", "40 120").await;

    h.state.close_all().await;
}

#[tokio::test]
async fn test_shell_starts_in_work_dir() {
    let mut h = harness(&["42"]);
    let expected = h
        .state
        .config
        .work_dir()
        .canonicalize()
        .unwrap()
        .to_string_lossy()
        .into_owned();

    h.connect("A", "42").await;
    h.next_control().await;

    h.input("A", "pwd -P\n").await;
    h.output_until("A", &expected).await;

    h.state.close_all().await;
}

#[tokio::test]
async fn test_child_exit_removes_session() {
    let mut h = harness(&["42"]);

    h.connect("A", "42").await;
    h.next_control().await;

    h.input("A", "exit\n").await;

    let state = h.state.clone();
    wait_until(move || state.sessions().is_empty()).await;

    // Late input for the dead session is ignored
    h.input("A", "ls\n").await;
    assert!(h.state.sessions().is_empty());
}

#[tokio::test]
async fn test_double_disconnect_is_harmless() {
    let mut h = harness(&["42"]);

    h.connect("A", "42").await;
    h.next_control().await;
    let session = h.state.sessions().get(&ConnectionId::new("A")).unwrap();

    h.send(r#"{"type":"client_disconnect","connection_id":"A"}"#).await;
    h.send(r#"{"type":"client_disconnect","connection_id":"A"}"#).await;

    session.close().await;
    session.close().await;

    assert!(session.pty().is_closed());
    assert!(h.state.sessions().is_empty());
}

#[tokio::test]
async fn test_duplicate_connect() {
    let mut h = harness(&["42", "43"]);

    h.connect("A", "42").await;
    assert!(matches!(
        h.next_control().await,
        Message::ConnectionReady { .. }
    ));

    // Same user: acknowledged again, no second terminal
    h.connect("A", "42").await;
    assert!(matches!(
        h.next_control().await,
        Message::ConnectionReady { .. }
    ));
    assert_eq!(h.state.sessions().len(), 1);

    // Different user: refused
    h.connect("A", "43").await;
    match h.next_control().await {
        Message::ConnectionFailed {
            connection_id,
            error,
        } => {
            assert_eq!(connection_id.as_str(), "A");
            assert_eq!(error, "connection id already in use");
        }
        other => panic!("Expected connection_failed, got {:?}", other),
    }
    assert_eq!(h.state.sessions().len(), 1);

    h.state.close_all().await;
}

#[tokio::test]
async fn test_reused_connection_id_survives_old_teardown() {
    let mut h = harness(&["42"]);

    h.connect("A", "42").await;
    h.next_control().await;
    let first = h.state.sessions().get(&ConnectionId::new("A")).unwrap();

    h.send(r#"{"type":"client_disconnect","connection_id":"A"}"#).await;
    h.connect("A", "42").await;
    assert!(matches!(
        h.next_control().await,
        Message::ConnectionReady { .. }
    ));

    // The first session's output task winds down after this point
    timeout(WAIT, first.pty().wait_exit()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = h.state.sessions().get(&ConnectionId::new("A")).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    h.input("A", "echo again_$((2 * 3))\n").await;
    h.output_until("A", "again_6").await;

    h.state.close_all().await;
}

#[tokio::test]
async fn test_persistent_session_reattaches() {
    let Some(tmux) = find_multiplexer() else {
        eprintln!("tmux not installed, skipping");
        return;
    };

    let user = format!("reattach{}", std::process::id());
    let mut h = harness_with(&[&user], Some(tmux.clone()));

    h.connect("A", &user).await;
    assert!(matches!(
        h.next_control().await,
        Message::ConnectionReady { .. }
    ));
    assert!(h
        .state
        .sessions()
        .get(&ConnectionId::new("A"))
        .unwrap()
        .is_persistent());

    h.input("A", "export RT_MARK=kept_$((3 * 5)); echo exported\n").await;
    h.output_until("A", "exported").await;

    h.send(r#"{"type":"client_disconnect","connection_id":"A"}"#).await;

    // A new connection for the same user lands in the same shell
    h.connect("B", &user).await;
    assert!(matches!(
        h.next_control().await,
        Message::ConnectionReady { .. }
    ));
    h.input("B", "echo mark=$RT_MARK\n").await;
    h.output_until("B", "mark=kept_15").await;

    h.state.close_all().await;

    let _ = std::process::Command::new(&tmux)
        .args(["kill-session", "-t", &multiplexer_session_name(&user)])
        .status();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_teardown_releases_reader_despite_background_job() {
    let mut h = harness(&["42"]);

    h.connect("A", "42").await;
    h.next_control().await;
    let session = h.state.sessions().get(&ConnectionId::new("A")).unwrap();
    let mut reader = format!("pty-read-{}", session.pty().pid().unwrap());
    reader.truncate(15);

    h.input("A", "sleep 30 & echo job=$! done\n").await;
    let seen = h.output_until("A", " done").await;
    let output: String = seen.into_iter().map(|(_, data)| data).collect();
    let job: i32 = output
        .split("job=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|pid| pid.parse().ok())
        .unwrap_or_else(|| panic!("no job pid in {:?}", output));

    h.send(r#"{"type":"client_disconnect","connection_id":"A"}"#).await;
    h.state.close_all().await;
    assert!(session.pty().is_closed());

    let reader_alive = move || {
        std::fs::read_dir("/proc/self/task")
            .map(|tasks| {
                tasks
                    .filter_map(Result::ok)
                    .filter_map(|t| std::fs::read_to_string(t.path().join("comm")).ok())
                    .any(|comm| comm.trim_end() == reader)
            })
            .unwrap_or(false)
    };
    let released = timeout(WAIT, async {
        while reader_alive() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    let _ = std::process::Command::new("kill")
        .args(["-9", &job.to_string()])
        .status();
    assert!(released.is_ok(), "PTY reader outlived teardown");
}
