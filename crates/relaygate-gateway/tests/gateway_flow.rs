//! End-to-end flows over real TCP: agents, clients and proxy managers
//! talking to a gateway bound on an ephemeral port.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;

use relaygate_core::config::GatewayConfig;
use relaygate_core::context::ClientOrigin;
use relaygate_core::dispatcher::{ClientRequest, ClientStatus};
use relaygate_core::packet::{Component, Packet, spec, types};
use relaygate_core::plugins::ReviewDecision;
use relaygate_core::plugins::review::DENIED_MESSAGE;
use relaygate_core::stream::PacketStream;
use relaygate_core::wal::{CommitStatus, read_contents};
use relaygate_gateway::agent::AGENT_DISCONNECTED;
use relaygate_gateway::auth::connect_packet;
use relaygate_gateway::{GatewayServer, GatewayState};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    server: Arc<GatewayServer>,
    addr: SocketAddr,
    dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let raw = format!(
            r#"
[server]
listen_addr = "127.0.0.1:0"
api_url = "http://gw.test/api"

[wal]
dir = "{wal}"
retain_committed = true

[storage]
dir = "{storage}"

[index]
dir = "{index}"

[[identities]]
token = "user-token"
org_id = "org"
id = "u1"
name = "Ana"
email = "ana@example.com"
groups = ["dba"]

[[identities]]
token = "agent-token"
kind = "agent"
org_id = "org"
id = "agent-1"
name = "main"

[[connections]]
name = "bash"
type = "application"
command = ["bash"]
agent_id = "agent-1"

[[connections]]
name = "bash-review"
type = "application"
agent_id = "agent-1"

[[plugins]]
name = "audit"
connections = [{{ connection = "bash" }}]

[[plugins]]
name = "indexer"
connections = [{{ connection = "bash" }}]

[[plugins]]
name = "dlp"
connections = [{{ connection = "bash", config = ["EMAIL_ADDRESS"] }}]

[[plugins]]
name = "review"
connections = [{{ connection = "bash-review", config = ["dba"] }}]
"#,
            wal = dir.path().join("wal").display(),
            storage = dir.path().join("transcripts").display(),
            index = dir.path().join("index").display(),
        );
        let config = GatewayConfig::parse(&raw).unwrap();
        config.validate().unwrap();

        let server = Arc::new(GatewayServer::from_config(&config).await.unwrap());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        Self { server, addr, dir }
    }

    fn state(&self) -> Arc<GatewayState> {
        self.server.state()
    }

    fn transcript_path(&self, sid: &str) -> PathBuf {
        self.dir
            .path()
            .join("transcripts")
            .join("org")
            .join(format!("{sid}.json"))
    }

    async fn dial(&self, handshake: Packet) -> (Arc<PacketStream>, Packet) {
        let tcp = TcpStream::connect(self.addr).await.unwrap();
        let stream = Arc::new(PacketStream::new(tcp, "test"));
        stream.send(handshake).await.unwrap();
        let reply = recv(&stream).await;
        (stream, reply)
    }

    async fn agent(&self) -> Arc<PacketStream> {
        let (stream, reply) = self
            .dial(connect_packet(ClientOrigin::Agent, "agent-token"))
            .await;
        assert!(reply.is_type(types::GATEWAY_CONNECT_OK), "got {}", reply.packet_type);
        stream
    }

    /// Connect a client and return its stream with the session id
    async fn client(&self, connection: &str) -> (Arc<PacketStream>, String) {
        let (stream, reply) = self
            .dial(
                connect_packet(ClientOrigin::Client, "user-token")
                    .with_spec(spec::handshake::CONNECTION_NAME, connection)
                    .with_spec(spec::handshake::VERB, "exec"),
            )
            .await;
        assert!(reply.is_type(types::GATEWAY_CONNECT_OK), "got {}", reply.packet_type);
        let sid = reply.session_id().unwrap().to_string();
        (stream, sid)
    }
}

async fn recv(stream: &PacketStream) -> Packet {
    timeout(WAIT, stream.recv())
        .await
        .expect("timed out waiting for a packet")
        .expect("stream ended")
}

fn client_packet(packet_type: &str, sid: &str) -> Packet {
    Packet::new(Component::Client, packet_type).with_spec(spec::SESSION_ID, sid)
}

fn agent_packet(packet_type: &str, sid: &str) -> Packet {
    Packet::new(Component::Agent, packet_type).with_spec(spec::SESSION_ID, sid)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_invalid_token_is_rejected() {
    let gw = Harness::start().await;
    let (stream, reply) = gw
        .dial(connect_packet(ClientOrigin::Client, "wrong"))
        .await;
    assert!(reply.is_type(types::GATEWAY_CONNECT_ERR));
    assert_eq!(reply.spec_str(spec::ERROR_CODE), Some("unauthenticated"));
    assert!(timeout(WAIT, stream.recv()).await.unwrap().is_err());
}

#[tokio::test]
async fn test_session_relay_between_client_and_agent() {
    let gw = Harness::start().await;
    let agent = gw.agent().await;
    let (client, sid) = gw.client("bash").await;

    client
        .send(client_packet(types::SESSION_OPEN, &sid))
        .await
        .unwrap();
    let open = recv(&agent).await;
    assert!(open.is_type(types::SESSION_OPEN));
    assert_eq!(open.session_id(), Some(sid.as_str()));
    assert_eq!(open.spec_str(spec::CONNECTION_NAME), Some("bash"));
    let params: serde_json::Value =
        serde_json::from_slice(open.spec.get(spec::CONNECTION_PARAMS).unwrap()).unwrap();
    assert_eq!(params["command"], serde_json::json!(["bash"]));
    assert_eq!(params["client_verb"], "exec");

    client
        .send(client_packet(types::WRITE_STDIN, &sid).with_payload("ls\n"))
        .await
        .unwrap();
    let stdin = recv(&agent).await;
    assert!(stdin.is_type(types::WRITE_STDIN));
    assert_eq!(stdin.payload, b"ls\n");

    agent
        .send(agent_packet(types::WRITE_STDOUT, &sid).with_payload("file.txt\n"))
        .await
        .unwrap();
    let stdout = recv(&client).await;
    assert!(stdout.is_type(types::WRITE_STDOUT));
    assert_eq!(stdout.payload, b"file.txt\n");

    client.close().await;
    let close = recv(&agent).await;
    assert!(close.is_type(types::SESSION_CLOSE));
    assert_eq!(close.session_id(), Some(sid.as_str()));
    let state = gw.state();
    wait_until(|| state.sessions.is_empty()).await;
}

#[tokio::test]
async fn test_agent_offline() {
    let gw = Harness::start().await;
    let (client, sid) = gw.client("bash").await;
    client
        .send(client_packet(types::SESSION_OPEN, &sid))
        .await
        .unwrap();
    let reply = recv(&client).await;
    assert!(reply.is_type(types::SESSION_OPEN_AGENT_OFFLINE));
    assert_eq!(reply.spec_str(spec::CONNECTION_TYPE), Some("application"));
}

#[tokio::test]
async fn test_unknown_connection_is_not_found() {
    let gw = Harness::start().await;
    let (_stream, reply) = gw
        .dial(
            connect_packet(ClientOrigin::Client, "user-token")
                .with_spec(spec::handshake::CONNECTION_NAME, "nope"),
        )
        .await;
    assert!(reply.is_type(types::GATEWAY_CONNECT_ERR));
    assert_eq!(reply.spec_str(spec::ERROR_CODE), Some("not-found"));
}

#[tokio::test]
async fn test_agent_disconnect_closes_sessions() {
    let gw = Harness::start().await;
    let agent = gw.agent().await;
    let (client, sid) = gw.client("bash").await;
    client
        .send(client_packet(types::SESSION_OPEN, &sid))
        .await
        .unwrap();
    assert!(recv(&agent).await.is_type(types::SESSION_OPEN));

    agent.close().await;
    let close = recv(&client).await;
    assert!(close.is_type(types::SESSION_CLOSE));
    assert_eq!(close.payload, AGENT_DISCONNECTED.as_bytes());
    let state = gw.state();
    wait_until(|| state.sessions.is_empty() && state.router.agent_count() == 0).await;
}

#[tokio::test]
async fn test_review_approval_opens_session() {
    let gw = Harness::start().await;
    let agent = gw.agent().await;
    let (client, sid) = gw.client("bash-review").await;

    client
        .send(client_packet(types::SESSION_OPEN, &sid).with_payload("drop table users;"))
        .await
        .unwrap();
    let waiting = recv(&client).await;
    assert!(waiting.is_type(types::SESSION_OPEN_WAITING_APPROVAL));
    assert_eq!(waiting.spec_str(spec::HAS_REVIEW), Some("1"));
    let review_url = String::from_utf8(waiting.payload).unwrap();
    assert!(review_url.starts_with("http://gw.test/api/reviews/"));

    let review = gw
        .state()
        .decide_review(&sid, Some("dba"), ReviewDecision::Approve)
        .await
        .unwrap();
    assert_eq!(review.input, "drop table users;");
    let approved = recv(&client).await;
    assert!(approved.is_type(types::SESSION_OPEN_APPROVE_OK));
    assert_eq!(approved.payload, b"drop table users;");

    client
        .send(client_packet(types::SESSION_OPEN, &sid).with_payload("drop table users;"))
        .await
        .unwrap();
    let open = recv(&agent).await;
    assert!(open.is_type(types::SESSION_OPEN));
    assert_eq!(open.payload, b"drop table users;");
}

#[tokio::test]
async fn test_review_rejection_closes_session() {
    let gw = Harness::start().await;
    let _agent = gw.agent().await;
    let (client, sid) = gw.client("bash-review").await;

    client
        .send(client_packet(types::SESSION_OPEN, &sid).with_payload("rm -rf /"))
        .await
        .unwrap();
    assert!(recv(&client).await.is_type(types::SESSION_OPEN_WAITING_APPROVAL));

    gw.state()
        .decide_review(&sid, None, ReviewDecision::Reject)
        .await
        .unwrap();
    let close = recv(&client).await;
    assert!(close.is_type(types::SESSION_CLOSE));
    assert_eq!(close.payload, DENIED_MESSAGE.as_bytes());
    let state = gw.state();
    wait_until(|| state.sessions.is_empty()).await;
}

#[tokio::test]
async fn test_jit_access_expires_open_session() {
    let gw = Harness::start().await;
    let agent = gw.agent().await;
    let (client, sid) = gw.client("bash-review").await;
    let jit_open = || client_packet(types::SESSION_OPEN, &sid).with_spec(spec::JIT_TIMEOUT, "2s");

    client.send(jit_open()).await.unwrap();
    assert!(recv(&client).await.is_type(types::SESSION_OPEN_WAITING_APPROVAL));
    let review = gw
        .state()
        .decide_review(&sid, None, ReviewDecision::Approve)
        .await
        .unwrap();
    assert!(review.revoke_at.is_some());
    assert!(recv(&client).await.is_type(types::SESSION_OPEN_APPROVE_OK));

    client.send(jit_open()).await.unwrap();
    assert!(recv(&agent).await.is_type(types::SESSION_OPEN));

    // nothing else reaches the client until the grant runs out
    let expired = recv(&client).await;
    assert!(expired.is_type(types::SESSION_OPEN_TIMEOUT), "got {}", expired.packet_type);
    assert_eq!(expired.session_id(), Some(sid.as_str()));
    let state = gw.state();
    wait_until(|| state.sessions.is_empty()).await;
}

#[tokio::test]
async fn test_audit_truncates_output_only() {
    let gw = Harness::start().await;
    let agent = gw.agent().await;
    let (client, sid) = gw.client("bash").await;

    client
        .send(client_packet(types::SESSION_OPEN, &sid))
        .await
        .unwrap();
    assert!(recv(&agent).await.is_type(types::SESSION_OPEN));

    client
        .send(client_packet(types::WRITE_STDIN, &sid).with_payload(vec![b'i'; 10 * 1024]))
        .await
        .unwrap();
    assert!(recv(&agent).await.is_type(types::WRITE_STDIN));

    const CHUNK: usize = 10 * 1024;
    const TOTAL: usize = 700 * 1024;
    let writer = {
        let agent = agent.clone();
        let sid = sid.clone();
        tokio::spawn(async move {
            for _ in 0..TOTAL / CHUNK {
                agent
                    .send(agent_packet(types::WRITE_STDOUT, &sid).with_payload(vec![b'o'; CHUNK]))
                    .await
                    .unwrap();
            }
        })
    };
    let mut received = 0;
    while received < TOTAL {
        let pkt = recv(&client).await;
        assert!(pkt.is_type(types::WRITE_STDOUT));
        received += pkt.payload.len();
    }
    writer.await.unwrap();
    client.close().await;

    let path = gw.transcript_path(&sid);
    wait_until(|| path.exists()).await;
    let transcript: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(transcript["is_input_truncated"], false);
    assert_eq!(transcript["is_output_truncated"], true);
    assert_eq!(transcript["connection_name"], "bash");
    assert!(transcript.get("session_error").is_none());

    let wal_path = gw.state().wal.path_for("org", &sid);
    wait_until(|| read_contents(&wal_path).is_ok_and(|c| c.footer.is_some())).await;
    let footer = read_contents(&wal_path).unwrap().footer.unwrap();
    assert_eq!(footer.commit_status, CommitStatus::Ok);
}

#[tokio::test]
async fn test_masked_output_is_what_gets_recorded() {
    let gw = Harness::start().await;
    let agent = gw.agent().await;
    let (client, sid) = gw.client("bash").await;
    client
        .send(client_packet(types::SESSION_OPEN, &sid))
        .await
        .unwrap();
    assert!(recv(&agent).await.is_type(types::SESSION_OPEN));

    agent
        .send(agent_packet(types::WRITE_STDOUT, &sid).with_payload("owner ada@example.com\n"))
        .await
        .unwrap();
    let stdout = recv(&client).await;
    assert_eq!(stdout.payload, b"owner [EMAIL_ADDRESS]\n");
    assert!(stdout.spec.contains_key(spec::DLP_SUMMARY));
    client.close().await;

    let path = gw.transcript_path(&sid);
    wait_until(|| path.exists()).await;
    let transcript: relaygate_core::wal::SessionTranscript =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let (_, output) = transcript.direction_text();
    assert_eq!(output, "owner [EMAIL_ADDRESS]\n");

    let state = gw.state();
    wait_until(|| {
        state
            .index
            .search("org", "owner", None, 10)
            .is_ok_and(|hits| hits.len() == 1)
    })
    .await;
    let hits = state.index.search("org", "owner", None, 10).unwrap();
    assert_eq!(hits[0].session_id, sid);
    assert!(!hits[0].output.contains("ada@example.com"));
    assert!(state.index.search("org", "example", None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_proxy_manager_dispatch() {
    let gw = Harness::start().await;
    let agent = gw.agent().await;
    let state = gw.state();

    let (pm, reply) = gw
        .dial(
            connect_packet(ClientOrigin::ClientProxyManager, "user-token")
                .with_spec(spec::handshake::CLIENT_ID, "pm-1")
                .with_spec(spec::handshake::HOSTNAME, "laptop"),
        )
        .await;
    assert!(reply.is_type(types::PROXY_MANAGER_CONNECT_OK));
    pm.send(Packet::new(Component::Client, types::PROXY_MANAGER_CONNECT_OK_ACK))
        .await
        .unwrap();
    wait_until(|| state.dispatcher.is_registered("pm-1")).await;

    let req = ClientRequest {
        id: "pm-1".to_string(),
        connection_name: "bash".to_string(),
        port: "5432".to_string(),
        access_duration: None,
    };
    assert_eq!(state.dispatcher.open_session(req.clone()).await, Ok(None));
    let open = recv(&agent).await;
    assert!(open.is_type(types::SESSION_OPEN));
    assert_eq!(open.spec_str(spec::CLIENT_REQUEST_PORT), Some("5432"));

    let status = state.dispatcher.status("pm-1").unwrap();
    assert_eq!(status.status, ClientStatus::Connected);
    assert_eq!(status.connection_name.as_deref(), Some("bash"));
    assert_eq!(status.metadata.get("hostname").map(String::as_str), Some("laptop"));

    assert!(state.dispatcher.disconnect(&req).is_ok());
    assert!(state.dispatcher.disconnect(&req).is_ok());
    assert!(timeout(WAIT, pm.recv()).await.unwrap().is_err());
    let close = recv(&agent).await;
    assert!(close.is_type(types::SESSION_CLOSE));
    assert_eq!(
        state.dispatcher.status("pm-1").unwrap().status,
        ClientStatus::Disconnected
    );
}

#[tokio::test]
async fn test_shutdown_ends_streams() {
    let gw = Harness::start().await;
    let agent = gw.agent().await;
    gw.server.shutdown();
    assert!(timeout(WAIT, agent.recv()).await.unwrap().is_err());
}
