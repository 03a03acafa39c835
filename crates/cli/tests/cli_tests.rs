// Integration tests for the petri-debug binary: exit codes and a console
// session against `petri-debug serve`.
//
// Run with: cargo test -p petri-debug-cli --test cli_tests -- --nocapture

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn petri_debug() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_petri-debug"));
    cmd.env_remove("RUST_LOG");
    cmd.env_remove("PETRI_DEBUG_HOST");
    cmd.env_remove("PETRI_DEBUG_PORT");
    cmd
}

/// Wait for `child` to exit, killing it after `limit`.
fn wait_with_deadline(child: &mut Child, name: &str, limit: Duration) -> ExitStatus {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            panic!("{} still running after {:?}", name, limit);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn hash_prints_sha1_of_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("net.cpp");
    std::fs::write(&source, "abc").unwrap();

    let output = petri_debug().args(["hash", source.to_str().unwrap()]).output().unwrap();
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "a9993e364706816aba3e25717850c26c9cd0d89d"
    );
}

#[test]
fn hash_missing_file_is_usage_error() {
    let output = petri_debug().args(["hash", "/nonexistent/net.cpp"]).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("/nonexistent/net.cpp"));
}

#[test]
fn attach_without_peer_is_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("net.lua");
    std::fs::write(&source, "-- net").unwrap();

    // Bind then release a port so nothing listens on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let output = petri_debug()
        .args(["attach", "--source", source.to_str().unwrap(), "--host", "127.0.0.1"])
        .args(["--port", &port.to_string()])
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(20), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stderr).contains("hint:"));
}

#[test]
fn console_session_against_serve() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("net.lua");
    std::fs::write(&source, "-- net").unwrap();
    let settings = dir.path().join("settings.json");
    std::fs::write(
        &settings,
        format!(
            "{{\n  // evaluators are Lua chunks\n  \"codegen.language\": \"lua\",\n  \"evaluation.tempDir\": {:?}\n}}\n",
            dir.path().to_str().unwrap()
        ),
    )
    .unwrap();

    let hash = {
        let output = petri_debug().args(["hash", source.to_str().unwrap()]).output().unwrap();
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    };

    let mut serve = petri_debug()
        .args(["serve", "--port", "0", "--hash", &hash, "--state", "7:2", "--var", "tokens=21"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut serve_out = BufReader::new(serve.stdout.take().unwrap());
    let mut line = String::new();
    serve_out.read_line(&mut line).unwrap();
    let addr = line.trim().strip_prefix("Listening on ").unwrap().to_string();
    let (host, port) = addr.rsplit_once(':').unwrap();

    let mut attach = petri_debug()
        .args(["attach", "--source", source.to_str().unwrap(), "--settings", settings.to_str().unwrap()])
        .args(["--host", host, "--port", port])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = attach.stdin.take().unwrap();
    let mut attach_out = BufReader::new(attach.stdout.take().unwrap());

    // Feed the next command once the previous one showed its effect
    let mut wait_for = |needle: &str| {
        let mut line = String::new();
        loop {
            line.clear();
            let n = attach_out.read_line(&mut line).unwrap();
            assert!(n > 0, "console ended before printing {:?}", needle);
            if line.contains(needle) {
                return;
            }
        }
    };

    wait_for("Successfully connected.");
    writeln!(stdin, "start").unwrap();
    wait_for("The petri net is running.");
    writeln!(stdin, "eval $tokens * 2").unwrap();
    wait_for("= 42");
    writeln!(stdin, "end").unwrap();

    let status = wait_with_deadline(&mut attach, "attach", Duration::from_secs(10));
    assert!(status.success());
    let status = wait_with_deadline(&mut serve, "serve", Duration::from_secs(10));
    assert!(status.success());
}
