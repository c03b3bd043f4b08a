//! Driving the tunnel control utilities (`wg`, `wg-quick`, `ip`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use shared_utils::config::TunnelConfig;

use super::error::{TunnelError, TunnelResult};

/// A peer as reported by the live interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub latest_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl LivePeer {
    /// Time since the latest handshake, `None` if there never was one.
    pub fn handshake_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.latest_handshake
            .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceStatus {
    pub public_key: String,
    pub listen_port: Option<u16>,
    pub addresses: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Added,
    AlreadyPresent,
}

/// Operations on the running tunnel interface.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn server_public_key(&self) -> TunnelResult<String> {
        Ok(self.show_interface().await?.public_key)
    }

    /// Create or update the live peer entry for `public_key`.
    async fn set_peer(&self, public_key: &str, allowed_ips: &str) -> TunnelResult<()>;

    /// Remove the live peer entry. Removing an unknown key succeeds.
    async fn remove_peer(&self, public_key: &str) -> TunnelResult<()>;

    async fn dump_peers(&self) -> TunnelResult<Vec<LivePeer>>;

    async fn show_interface(&self) -> TunnelResult<InterfaceStatus>;

    async fn add_route(&self, destination: Ipv4Net) -> TunnelResult<RouteOutcome>;

    /// Bring the interface down and up again from its definition file.
    async fn restart(&self) -> TunnelResult<()>;
}

/// Runs commands, optionally through a prefix such as
/// `docker exec wireguard-server`, with a time limit.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    prefix: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(prefix: Vec<String>, timeout: Duration) -> Self {
        Self { prefix, timeout }
    }

    fn describe(&self, program: &str, args: &[&str]) -> String {
        self.prefix
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(program))
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion and return the raw output, whatever the exit status.
    pub async fn output(&self, program: &str, args: &[&str]) -> TunnelResult<Output> {
        let command_line = self.describe(program, args);
        debug!("Running command: {}", command_line);

        let mut command = match self.prefix.split_first() {
            Some((head, rest)) => {
                let mut command = Command::new(head);
                command.args(rest).arg(program);
                command
            }
            None => Command::new(program),
        };
        command.args(args).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(TunnelError::Spawn {
                command: command_line,
                source,
            }),
            Err(_) => Err(TunnelError::Timeout {
                command: command_line,
            }),
        }
    }

    /// Run and require success; returns trimmed stdout.
    pub async fn run(&self, program: &str, args: &[&str]) -> TunnelResult<String> {
        let output = self.output(program, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TunnelError::Command {
                command: self.describe(program, args),
                stderr: if stderr.is_empty() {
                    format!("exit code {:?}", output.status.code())
                } else {
                    stderr
                },
            });
        }
        // stdout is never logged: `wg show dump` starts with the private key
        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!(
            bytes = output.stdout.len(),
            lines = stdout.lines().count(),
            "command succeeded"
        );
        Ok(stdout.trim().to_string())
    }
}

/// `TunnelControl` backed by the wireguard-tools binaries and iproute2.
#[derive(Debug, Clone)]
pub struct WgCommandControl {
    interface: String,
    wg: String,
    wg_quick: String,
    ip: String,
    runner: CommandRunner,
}

impl WgCommandControl {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            wg: config.wg_binary.clone(),
            wg_quick: config.wg_quick_binary.clone(),
            ip: config.ip_binary.clone(),
            runner: CommandRunner::new(config.exec_prefix.clone(), config.command_timeout()),
        }
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    async fn dump(&self) -> TunnelResult<(String, Option<u16>, Vec<LivePeer>)> {
        let stdout = self
            .runner
            .run(&self.wg, &["show", &self.interface, "dump"])
            .await?;
        parse_dump(&stdout).map_err(|message| TunnelError::UnexpectedOutput {
            command: format!("{} show {} dump", self.wg, self.interface),
            message,
        })
    }
}

#[async_trait]
impl TunnelControl for WgCommandControl {
    async fn set_peer(&self, public_key: &str, allowed_ips: &str) -> TunnelResult<()> {
        self.runner
            .run(
                &self.wg,
                &["set", &self.interface, "peer", public_key, "allowed-ips", allowed_ips],
            )
            .await?;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> TunnelResult<()> {
        self.runner
            .run(&self.wg, &["set", &self.interface, "peer", public_key, "remove"])
            .await?;
        Ok(())
    }

    async fn dump_peers(&self) -> TunnelResult<Vec<LivePeer>> {
        Ok(self.dump().await?.2)
    }

    async fn show_interface(&self) -> TunnelResult<InterfaceStatus> {
        let (public_key, listen_port, _) = self.dump().await?;
        let stdout = self
            .runner
            .run(&self.ip, &["-4", "-o", "addr", "show", "dev", &self.interface])
            .await?;

        Ok(InterfaceStatus {
            public_key,
            listen_port,
            addresses: parse_addresses(&stdout),
        })
    }

    async fn add_route(&self, destination: Ipv4Net) -> TunnelResult<RouteOutcome> {
        let destination = destination.to_string();
        let args = ["route", "add", destination.as_str(), "dev", self.interface.as_str()];
        let output = self.runner.output(&self.ip, &args).await?;

        if output.status.success() {
            return Ok(RouteOutcome::Added);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            return Ok(RouteOutcome::AlreadyPresent);
        }

        Err(TunnelError::Command {
            command: format!("{} {}", self.ip, args.join(" ")),
            stderr: stderr.trim().to_string(),
        })
    }

    async fn restart(&self) -> TunnelResult<()> {
        if let Err(err) = self.runner.run(&self.wg_quick, &["down", &self.interface]).await {
            warn!(interface = %self.interface, "interface did not go down cleanly: {err}");
        }
        self.runner.run(&self.wg_quick, &["up", &self.interface]).await?;
        Ok(())
    }
}

fn none_or(field: &str) -> Option<&str> {
    match field {
        "" | "(none)" => None,
        value => Some(value),
    }
}

/// Parse `wg show <if> dump`: the first line describes the interface, every
/// following line one peer, fields tab-separated.
pub fn parse_dump(text: &str) -> Result<(String, Option<u16>, Vec<LivePeer>), String> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let header = lines.next().ok_or("empty dump")?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() < 3 {
        return Err(format!("interface line has {} fields", fields.len()));
    }
    let public_key = fields[1].to_string();
    let listen_port = fields[2].parse::<u16>().ok().filter(|port| *port != 0);

    let mut peers = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            return Err(format!("peer line has {} fields", fields.len()));
        }

        let handshake: i64 = fields[4]
            .parse()
            .map_err(|_| format!("bad handshake timestamp {}", fields[4]))?;
        let latest_handshake = if handshake > 0 {
            DateTime::from_timestamp(handshake, 0)
        } else {
            None
        };

        peers.push(LivePeer {
            public_key: fields[0].to_string(),
            endpoint: none_or(fields[2]).map(str::to_string),
            allowed_ips: none_or(fields[3])
                .map(|ips| ips.split(',').map(|ip| ip.trim().to_string()).collect())
                .unwrap_or_default(),
            latest_handshake,
            rx_bytes: fields[5].parse().unwrap_or(0),
            tx_bytes: fields[6].parse().unwrap_or(0),
        });
    }

    Ok((public_key, listen_port, peers))
}

/// Collect `inet` addresses from `ip -4 -o addr show` output.
pub fn parse_addresses(text: &str) -> Vec<Ipv4Net> {
    text.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|token| *token == "inet")?;
            tokens.next()?.parse().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DUMP: &str = "\
c2VydmVyLXByaXZhdGUta2V5LXBsYWNlaG9sZGVyLTAwMDA=\tU2VydmVyUHVibGljS2V5UGxhY2Vob2xkZXIwMDAwMDA=\t51820\toff
QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUE=\t(none)\t203.0.113.7:40112\t10.100.1.1/32\t1700000000\t1024\t2048\t25
QkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkI=\t(none)\t(none)\t10.100.1.2/32,192.168.5.0/24\t0\t0\t0\toff
";

    #[test]
    fn parses_dump() {
        let (public_key, port, peers) = parse_dump(DUMP).unwrap();
        assert_eq!(public_key, "U2VydmVyUHVibGljS2V5UGxhY2Vob2xkZXIwMDAwMDA=");
        assert_eq!(port, Some(51820));
        assert_eq!(peers.len(), 2);

        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.7:40112"));
        assert_eq!(peers[0].allowed_ips, vec!["10.100.1.1/32"]);
        assert_eq!(peers[0].latest_handshake.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(peers[0].rx_bytes, 1024);

        assert_eq!(peers[1].endpoint, None);
        assert_eq!(peers[1].allowed_ips, vec!["10.100.1.2/32", "192.168.5.0/24"]);
        assert_eq!(peers[1].latest_handshake, None);
        assert_eq!(peers[1].handshake_age(Utc::now()), None);
    }

    #[test]
    fn rejects_short_dump() {
        assert!(parse_dump("").is_err());
        assert!(parse_dump("a\tb\t1\toff\nkey\t(none)\n").is_err());
    }

    #[test]
    fn parses_addresses() {
        let out = "4: wg0    inet 10.100.0.1/32 scope global wg0\\       valid_lft forever preferred_lft forever\n\
                   4: wg0    inet 10.100.0.9/16 scope global secondary wg0\\       valid_lft forever\n";
        let addrs = parse_addresses(out);
        assert_eq!(
            addrs,
            vec![
                "10.100.0.1/32".parse::<Ipv4Net>().unwrap(),
                "10.100.0.9/16".parse::<Ipv4Net>().unwrap()
            ]
        );
        assert!(parse_addresses("").is_empty());
    }

    #[test]
    fn describes_prefixed_commands() {
        let runner = CommandRunner::new(
            vec!["docker".into(), "exec".into(), "wireguard-server".into()],
            Duration::from_secs(1),
        );
        assert_eq!(
            runner.describe("wg", &["show", "wg0", "dump"]),
            "docker exec wireguard-server wg show wg0 dump"
        );
    }

    #[tokio::test]
    async fn reports_failed_commands() {
        let runner = CommandRunner::new(Vec::new(), Duration::from_secs(5));
        match runner.run("sh", &["-c", "echo not ready >&2; exit 1"]).await {
            Err(err @ TunnelError::Command { .. }) => {
                assert!(err.is_transient());
                assert!(err.to_string().contains("not ready"));
            }
            other => panic!("expected command failure, got {other:?}"),
        }

        assert_eq!(runner.run("sh", &["-c", "echo ok"]).await.unwrap(), "ok");
        assert!(matches!(
            runner.run("/definitely/missing/binary", &[]).await,
            Err(TunnelError::Spawn { .. })
        ));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn command_output_stays_out_of_the_logs() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump");
        std::fs::write(&dump, DUMP).unwrap();
        let private_key = DUMP.split('\t').next().unwrap();

        let runner = CommandRunner::new(Vec::new(), Duration::from_secs(5));
        let stdout = runner
            .run("cat", &[dump.to_str().unwrap()])
            .await
            .unwrap();
        assert!(stdout.starts_with(private_key));

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("command succeeded"), "{logs}");
        assert!(!logs.contains(private_key), "{logs}");
    }
}
