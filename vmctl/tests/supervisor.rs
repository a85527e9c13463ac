//! Process supervision against a fake hypervisor script.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use vmctl::{ConnectPolicy, Error, Hypervisor, ImageTool, Phase, Runtime, StoreLayout, VmEvent};

const SCRIPT: &str = r#"#!/bin/sh
echo "fake-qemu $#"
echo "fake-qemu stderr" >&2
while IFS= read -r line; do
  echo "console: $line"
done
exec sleep 30
"#;

/// Console output that is not valid UTF-8, followed by a plain line.
const BINARY_SCRIPT: &str = r#"#!/bin/sh
printf 'boot \304\315 menu\n'
echo "after-invalid"
exec sleep 5
"#;

/// Writes the fake hypervisors once per test binary.
///
/// Every test waits for this before spawning anything, so no child can
/// inherit a script's write descriptor.
fn scripts() -> &'static PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("vmctl-fake-qemu-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in [("qemu-system-x86_64", SCRIPT), ("qemu-binary-console", BINARY_SCRIPT)] {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        dir
    })
}

fn fake_qemu() -> PathBuf {
    scripts().join("qemu-system-x86_64")
}

fn runtime(window: Duration) -> (tempfile::TempDir, Runtime) {
    runtime_with(fake_qemu(), window)
}

fn runtime_with(hypervisor: PathBuf, window: Duration) -> (tempfile::TempDir, Runtime) {
    let tmp = tempfile::tempdir().unwrap();
    let policy = ConnectPolicy::default()
        .window(window)
        .interval(Duration::from_millis(20))
        .io_timeout(Duration::from_millis(500))
        .reply_timeout(Duration::from_secs(2));
    let rt = Runtime::open(StoreLayout::new(tmp.path()))
        .unwrap()
        .with_hypervisor(Hypervisor::Path(hypervisor))
        .with_image_tool(ImageTool::Disabled)
        .with_policy(policy);
    (tmp, rt)
}

const GREETING: &[u8] = b"{\"QMP\": {\"version\": {\"qemu\": {\"major\": 9, \"minor\": 0, \"micro\": 0}, \"package\": \"\"}, \"capabilities\": []}}\n";

/// Serves one QMP session, answering each command with `reply(cmd)`.
///
/// Resolves to the executed command names once the client hangs up.
async fn qmp_server(listener: TcpListener, reply: fn(&Value) -> String) -> Vec<String> {
    let (stream, _) = listener.accept().await.unwrap();
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();
    w.write_all(GREETING).await.unwrap();
    let mut seen = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let cmd: Value = serde_json::from_str(&line).unwrap();
        seen.push(cmd["execute"].as_str().unwrap().to_owned());
        let mut out = reply(&cmd);
        out.push('\n');
        w.write_all(out.as_bytes()).await.unwrap();
    }
    seen
}

fn empty_return(_: &Value) -> String {
    r#"{"return": {}}"#.to_owned()
}

/// Receives events until one matches, failing after five seconds.
async fn until(rx: &mut UnboundedReceiver<VmEvent>, pred: impl Fn(&VmEvent) -> bool) -> VmEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let ev = rx.recv().await.unwrap();
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn streams_output_and_reports_exit_once() {
    let (_tmp, rt) = runtime(Duration::from_secs(1));
    let mut vm = rt.create("vm").unwrap();
    vm.config_mut().disk_gib = 0;
    let mut rx = vm.start(None).unwrap();
    assert!(vm.is_alive());

    let out = until(&mut rx, |e| matches!(e, VmEvent::Stdout(_))).await;
    assert!(matches!(out, VmEvent::Stdout(ref l) if l.starts_with("fake-qemu ")));
    until(&mut rx, |e| *e == VmEvent::Stderr("fake-qemu stderr".into())).await;

    vm.write_stdin(b"hello\n").await.unwrap();
    until(&mut rx, |e| *e == VmEvent::Stdout("console: hello".into())).await;

    vm.kill().unwrap();
    let exit = until(&mut rx, |e| matches!(e, VmEvent::Exited { .. })).await;
    assert_eq!(exit, VmEvent::Exited { code: None });
    assert_eq!(vm.wait().await, None);
    assert_eq!(vm.phase(), Phase::Stopped);

    // All senders are gone once the process and its readers are done.
    let rest = timeout(Duration::from_secs(5), async {
        let mut n = 0;
        while let Some(ev) = rx.recv().await {
            assert!(!matches!(ev, VmEvent::Exited { .. }));
            n += 1;
        }
        n
    })
    .await;
    assert!(rest.is_ok());
}

#[tokio::test]
async fn second_start_fails_without_spawning() {
    let (_tmp, rt) = runtime(Duration::from_secs(1));
    let mut vm = rt.create("vm").unwrap();
    vm.config_mut().disk_gib = 0;
    let _rx = vm.start(None).unwrap();
    let pid = vm.runtime().unwrap().process().pid();

    assert!(matches!(vm.start(None), Err(Error::AlreadyRunning(_))));
    assert_eq!(vm.runtime().unwrap().process().pid(), pid);

    vm.kill().unwrap();
    vm.wait().await;
    let _rx = vm.start(None).unwrap();
    assert_ne!(vm.runtime().unwrap().process().pid(), pid);
    vm.kill().unwrap();
    vm.wait().await;
}

#[tokio::test]
async fn stop_without_control_terminates() {
    let (_tmp, rt) = runtime(Duration::from_millis(200));
    let mut vm = rt.create("vm").unwrap();
    vm.config_mut().disk_gib = 0;
    let mut rx = vm.start(None).unwrap();
    assert_eq!(vm.phase(), Phase::Launching);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(vm.phase(), Phase::Unreachable);

    vm.stop().await.unwrap();
    let exit = until(&mut rx, |e| matches!(e, VmEvent::Exited { .. })).await;
    assert_eq!(exit, VmEvent::Exited { code: None });
}

#[tokio::test]
async fn stop_with_control_sends_powerdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(qmp_server(listener, empty_return));

    let (_tmp, rt) = runtime(Duration::from_secs(3));
    let mut vm = rt.create("vm").unwrap();
    vm.config_mut().disk_gib = 0;
    vm.config_mut().advanced.control_port = Some(port);
    vm.save().unwrap();

    let _rx = vm.start(None).unwrap();
    assert!(vm.wait_control(Duration::from_secs(3)).await);
    assert_eq!(vm.phase(), Phase::Running);
    assert_eq!(vm.config().advanced.control_port, Some(port));

    vm.stop().await.unwrap();
    // Power-down only asks the guest; the process is still alive.
    assert!(vm.is_alive());
    assert_eq!(vm.phase(), Phase::Stopping);

    vm.kill().unwrap();
    vm.wait().await;
    drop(vm);
    let seen = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(seen, ["qmp_capabilities", "system_powerdown"]);
}

#[tokio::test]
async fn console_bytes_that_are_not_utf8_keep_streaming() {
    let (_tmp, rt) = runtime_with(scripts().join("qemu-binary-console"), Duration::from_millis(200));
    let mut vm = rt.create("vm").unwrap();
    vm.config_mut().disk_gib = 0;
    let mut rx = vm.start(None).unwrap();

    until(&mut rx, |e| *e == VmEvent::Stdout("boot \u{FFFD}\u{FFFD} menu".into())).await;
    until(&mut rx, |e| *e == VmEvent::Stdout("after-invalid".into())).await;
    // The reader kept the pipe open, so the script is still sleeping.
    assert!(vm.is_alive());

    vm.kill().unwrap();
    let exit = until(&mut rx, |e| matches!(e, VmEvent::Exited { .. })).await;
    assert_eq!(exit, VmEvent::Exited { code: None });
}

/// Answers `savevm` the way the human monitor does: an error is text.
fn savevm_reply(cmd: &Value) -> String {
    let line = cmd["arguments"]["command-line"].as_str().unwrap_or_default();
    if line == "savevm broken" {
        r#"{"return": "Error: Device 'virtio0' is writable but does not support snapshots\r\n"}"#
            .to_owned()
    } else if cmd["execute"] == "human-monitor-command" {
        r#"{"return": ""}"#.to_owned()
    } else {
        empty_return(cmd)
    }
}

#[tokio::test]
async fn snapshot_reports_monitor_error_text() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(qmp_server(listener, savevm_reply));

    let (_tmp, rt) = runtime(Duration::from_secs(3));
    let mut vm = rt.create("vm").unwrap();
    vm.config_mut().disk_gib = 0;
    vm.config_mut().advanced.control_port = Some(port);
    vm.save().unwrap();

    let _rx = vm.start(None).unwrap();
    assert!(vm.wait_control(Duration::from_secs(3)).await);

    vm.snapshot("ok").await.unwrap();
    let err = vm.snapshot("broken").await.unwrap_err();
    assert!(
        err.to_string().contains("does not support snapshots"),
        "{err}"
    );

    vm.kill().unwrap();
    vm.wait().await;
    drop(vm);
    let seen = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(
        seen,
        ["qmp_capabilities", "human-monitor-command", "human-monitor-command"]
    );
}
