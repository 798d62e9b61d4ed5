//! `tunnel --stdio` must exit as soon as its session ends, even while stdin
//! is still open.

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_burrow-admin");

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn spawn_serve(config: &Path, listen: &str) -> KillOnDrop {
    let child = Command::new(BIN)
        .arg("--config")
        .arg(config)
        .args(["serve", "--listen", listen])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let server = KillOnDrop(child);

    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(listen).is_err() {
        assert!(Instant::now() < deadline, "server never started listening");
        thread::sleep(Duration::from_millis(20));
    }
    server
}

fn wait_for_exit(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }
    None
}

#[test]
fn test_stdio_tunnel_exits_after_dial_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    let listen = free_addr();
    let _server = spawn_serve(&config, &listen);

    // Nothing listens here, so the server reports a dial failure
    let unreachable = free_addr();
    let child = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .args(["tunnel", "--address", &listen, "--stdio", &unreachable])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    // stdin stays open until the guard drops
    let mut tunnel = KillOnDrop(child);

    let status = wait_for_exit(&mut tunnel.0, Duration::from_secs(10))
        .expect("tunnel should exit once its session ends");
    assert!(!status.success());
}
