use mc_registry::address::ServerAddress;
use mc_registry::config::Config;
use mc_registry::database::{MemoryRegistry, RegistryStore};
use mc_registry::models::AuthMode;
use mc_registry::ping::{probe_status, StatusError};
use mc_registry::protocol::{read_packet, DisconnectPolicy, LoginProbe};
use mc_registry::scanner::Scanner;
use mc_registry::varint::{write_string, write_varint};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONFIG: &str = r#"
[scanner]
timeout_ms = 2000
concurrency = 8
progress = false

[classifier]
known_networks = ["universocraft"]
auth_plugin_signatures = ["authme"]
cracked_keywords = ["cracked"]
"#;

fn frame(id: u32, body: &[u8]) -> Vec<u8> {
	let mut packet = Vec::new();
	write_varint(&mut packet, id);
	packet.extend_from_slice(body);

	let mut framed = Vec::new();
	write_varint(&mut framed, packet.len() as u32);
	framed.extend(packet);
	framed
}

fn status_json(motd: &str, online: i64) -> Vec<u8> {
	let json = format!(
		r#"{{"version":{{"name":"1.20.4","protocol":765}},"players":{{"max":100,"online":{online},"sample":[{{"name":"a","id":"00000000-0000-0000-0000-000000000000"}}]}},"description":{{"text":"{motd}"}},"favicon":"data:image/png;base64,AAAA"}}"#
	);
	let mut body = Vec::new();
	write_string(&mut body, &json);
	frame(0x00, &body)
}

/// Answers every login with `login_reply` and every status request with `status_reply`
async fn fixture(login_reply: Vec<u8>, status_reply: Vec<u8>) -> ServerAddress {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();

	tokio::spawn(async move {
		loop {
			let Ok((socket, _)) = listener.accept().await else {
				return;
			};
			let (login_reply, status_reply) = (login_reply.clone(), status_reply.clone());
			tokio::spawn(serve(socket, login_reply, status_reply));
		}
	});

	ServerAddress::parse(&format!("127.0.0.1:{port}")).unwrap()
}

async fn serve(mut socket: TcpStream, login_reply: Vec<u8>, status_reply: Vec<u8>) {
	let Ok((0x00, handshake)) = read_packet(&mut socket).await else {
		return;
	};
	// Next state is the last field, a one byte varint
	let reply = match handshake.last() {
		Some(1) => status_reply,
		_ => login_reply,
	};
	let _ = read_packet(&mut socket).await;

	let _ = socket.write_all(&reply).await;
	let _ = socket.flush().await;
	let _ = socket.shutdown().await;

	// Hold the connection until the client hangs up
	let mut sink = Vec::new();
	let _ = socket.read_to_end(&mut sink).await;
}

fn probe() -> LoginProbe {
	LoginProbe {
		timeout: Duration::from_secs(2),
		..LoginProbe::default()
	}
}

#[tokio::test]
async fn encryption_request_is_premium() {
	let address = fixture(frame(0x01, &[0, 0, 0]), Vec::new()).await;
	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::Premium);
}

#[tokio::test]
async fn login_success_is_non_premium() {
	let address = fixture(frame(0x02, &[0; 17]), Vec::new()).await;
	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::NonPremium);
}

#[tokio::test]
async fn set_compression_is_non_premium() {
	let address = fixture(frame(0x03, &[0x80, 0x02]), Vec::new()).await;
	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::NonPremium);
}

#[tokio::test]
async fn disconnect_follows_policy() {
	let mut reason = Vec::new();
	write_string(&mut reason, r#"{"text":"You are not whitelisted"}"#);
	let address = fixture(frame(0x00, &reason), Vec::new()).await;

	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::NonPremium);

	let cautious = LoginProbe {
		disconnect_policy: DisconnectPolicy::Unknown,
		..probe()
	};
	assert_eq!(cautious.probe_auth_mode(&address).await, AuthMode::Unknown);
}

#[tokio::test]
async fn unexpected_packet_is_unknown() {
	let address = fixture(frame(0x04, &[1, 2, 3]), Vec::new()).await;
	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::Unknown);
}

#[tokio::test]
async fn refused_connection_is_offline() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	drop(listener);

	let address = ServerAddress::parse(&format!("127.0.0.1:{port}")).unwrap();
	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::Offline);
	assert!(matches!(
		probe_status(&address, Duration::from_secs(1)).await,
		Err(StatusError::Offline(_))
	));
}

#[tokio::test]
async fn truncated_length_prefix_is_unknown() {
	// Continuation bit set, then the stream ends
	let address = fixture(vec![0x80], Vec::new()).await;
	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::Unknown);
}

#[tokio::test]
async fn truncated_body_is_unknown() {
	let address = fixture(vec![0x0a, 0x01, 0x00], Vec::new()).await;
	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::Unknown);
}

#[tokio::test]
async fn empty_packet_is_unknown() {
	let address = fixture(vec![0x00], Vec::new()).await;
	assert_eq!(probe().probe_auth_mode(&address).await, AuthMode::Unknown);
}

#[tokio::test]
async fn silent_server_times_out_as_unknown() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		let mut held = Vec::new();
		while let Ok((socket, _)) = listener.accept().await {
			held.push(socket);
		}
	});

	let address = ServerAddress::parse(&format!("127.0.0.1:{port}")).unwrap();
	let quick = LoginProbe {
		timeout: Duration::from_millis(200),
		..LoginProbe::default()
	};
	assert_eq!(quick.probe_auth_mode(&address).await, AuthMode::Unknown);
}

#[tokio::test]
async fn status_ping_reads_metadata() {
	let address = fixture(Vec::new(), status_json("§aHello §lworld", 42)).await;

	let status = probe_status(&address, Duration::from_secs(2)).await.unwrap();
	assert_eq!(status.version, "1.20.4");
	assert_eq!(status.protocol, 765);
	assert_eq!(status.motd, "Hello world");
	assert_eq!(status.players_online, 42);
	assert_eq!(status.players_max, 100);
	assert_eq!(status.sample_size, 1);
	assert_eq!(status.favicon.as_deref(), Some("data:image/png;base64,AAAA"));
}

#[tokio::test]
async fn scanner_records_live_and_purges_dead() {
	let config: Arc<Config> = Arc::new(CONFIG.parse().unwrap());
	let store = Arc::new(MemoryRegistry::new());
	let scanner = Scanner::new(config).store(store.clone()).build();

	let premium = fixture(frame(0x01, &[0, 0, 0]), status_json("Survival", 12)).await;
	let cracked = fixture(frame(0x01, &[0, 0, 0]), status_json("Cracked server", 7)).await;
	let empty = fixture(frame(0x02, &[0; 17]), status_json("Nobody here", 0)).await;

	let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let dead_port = dead_listener.local_addr().unwrap().port();
	drop(dead_listener);

	let inputs = vec![
		premium.to_string(),
		cracked.to_string(),
		empty.to_string(),
		format!("127.0.0.1:{dead_port}"),
		"   ".to_string(),
	];

	let (report, summary) = scanner.run(inputs).await.unwrap();
	assert_eq!(report.outcomes.len(), 5);
	assert_eq!(report.offline, 1);
	assert_eq!(report.errors.invalid_addresses(), 1);
	assert_eq!(summary.recorded, 2);
	assert_eq!(summary.skipped, 1);
	assert_eq!(summary.purged, 0);

	let premium_record = store.get_server(&premium).await.unwrap().unwrap();
	assert!(premium_record.is_canonical);
	assert!(premium_record.favicon_hash.is_some());
	assert_eq!(premium_record.resolved_ip, premium.ipv4());

	let snapshots = store.snapshots_of(&premium).await.unwrap();
	assert_eq!(snapshots.len(), 1);
	assert_eq!(snapshots[0].auth_mode, AuthMode::Premium);
	assert_eq!(snapshots[0].sample_size, 1);

	// The MOTD heuristic wins over the login probe
	let cracked_snapshots = store.snapshots_of(&cracked).await.unwrap();
	assert_eq!(cracked_snapshots[0].auth_mode, AuthMode::NonPremium);

	assert!(store.get_server(&empty).await.unwrap().is_none());
}

/// Tracks how many connections sit between accept and reply at the same time
#[derive(Default)]
struct InFlight {
	current: AtomicUsize,
	peak: AtomicUsize,
}

async fn counting_fixture(in_flight: Arc<InFlight>) -> ServerAddress {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();

	tokio::spawn(async move {
		while let Ok((mut socket, _)) = listener.accept().await {
			let in_flight = in_flight.clone();
			tokio::spawn(async move {
				let now = in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
				in_flight.peak.fetch_max(now, Ordering::SeqCst);

				let Ok((0x00, handshake)) = read_packet(&mut socket).await else {
					in_flight.current.fetch_sub(1, Ordering::SeqCst);
					return;
				};
				let reply = match handshake.last() {
					Some(1) => status_json("Survival", 5),
					_ => frame(0x01, &[0, 0, 0]),
				};
				let _ = read_packet(&mut socket).await;
				tokio::time::sleep(Duration::from_millis(50)).await;

				// Released before the client can see the reply and free its slot
				in_flight.current.fetch_sub(1, Ordering::SeqCst);
				let _ = socket.write_all(&reply).await;
				let _ = socket.shutdown().await;
				let mut sink = Vec::new();
				let _ = socket.read_to_end(&mut sink).await;
			});
		}
	});

	ServerAddress::parse(&format!("127.0.0.1:{port}")).unwrap()
}

#[tokio::test]
async fn batch_respects_concurrency_bound() {
	let contents = CONFIG.replace("concurrency = 8", "concurrency = 2");
	let config: Arc<Config> = Arc::new(contents.parse().unwrap());
	let scanner = Scanner::new(config).build();

	let in_flight = Arc::new(InFlight::default());
	let address = counting_fixture(in_flight.clone()).await;
	let inputs = vec![address.to_string(); 10];

	let report = scanner.verify_batch(inputs).await;
	assert_eq!(report.succeeded, 10);

	let peak = in_flight.peak.load(Ordering::SeqCst);
	assert!((1..=2).contains(&peak), "peak of {peak} connections in flight");
}
