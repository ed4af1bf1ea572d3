//! Helper process supervision tests using /bin/sh as the helper

#![cfg(unix)]

use std::time::Duration;
use tokio::sync::mpsc;
use tunlink_core::vpn::process::{HelperProcess, ProcessExit};

fn shell() -> HelperProcess {
    HelperProcess::new("shell", "/bin/sh")
}

fn script(body: &str) -> Vec<String> {
    vec!["-c".to_string(), body.to_string()]
}

fn exit_channel(helper: &HelperProcess) -> mpsc::UnboundedReceiver<ProcessExit> {
    let (tx, rx) = mpsc::unbounded_channel();
    helper.on_exit(move |exit| {
        let _ = tx.send(exit);
    });
    rx
}

async fn next_exit(rx: &mut mpsc::UnboundedReceiver<ProcessExit>) -> ProcessExit {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no exit notification")
        .expect("listener dropped")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<ProcessExit>) {
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "unexpected extra exit notification: {:?}", extra);
}

#[tokio::test]
async fn test_natural_exit_reported_once_with_code() {
    let helper = shell();
    let mut exits = exit_channel(&helper);

    helper.launch(script("exit 3"));

    assert_eq!(next_exit(&mut exits).await, ProcessExit::Exited(Some(3)));
    assert_quiet(&mut exits).await;
    assert!(!helper.is_running());
}

#[tokio::test]
async fn test_stop_terminates_running_process() {
    // Given: a long-running helper
    let helper = shell();
    let mut exits = exit_channel(&helper);
    helper.launch(script("exec sleep 3600"));
    assert!(helper.is_running());
    assert!(helper.pid().is_some());

    // When: it is stopped twice
    helper.stop();
    helper.stop();

    // Then: it exits by signal, reported once
    assert_eq!(next_exit(&mut exits).await, ProcessExit::Exited(None));
    assert_quiet(&mut exits).await;
    assert_eq!(helper.pid(), None);
}

#[tokio::test]
async fn test_stop_before_launch_fires_exactly_once() {
    let helper = shell();
    let mut exits = exit_channel(&helper);

    helper.stop();
    helper.stop();

    assert_eq!(next_exit(&mut exits).await, ProcessExit::NeverStarted);
    assert_quiet(&mut exits).await;
}

#[tokio::test]
async fn test_launch_while_running_is_ignored() {
    let helper = shell();
    let mut exits = exit_channel(&helper);
    helper.launch(script("exec sleep 3600"));
    let pid = helper.pid();

    helper.launch(script("exit 0"));

    assert_eq!(helper.pid(), pid);
    helper.stop();
    assert_eq!(next_exit(&mut exits).await, ProcessExit::Exited(None));
    assert_quiet(&mut exits).await;
}

#[tokio::test]
async fn test_relaunch_after_exit_with_swapped_listener() {
    // Given: a helper that exited once
    let helper = shell();
    let mut first = exit_channel(&helper);
    helper.launch(script("exit 1"));
    assert_eq!(next_exit(&mut first).await, ProcessExit::Exited(Some(1)));

    // When: the listener is replaced and the helper launched again
    let mut second = exit_channel(&helper);
    helper.launch(script("exit 2"));

    // Then: only the new listener hears about the second exit
    assert_eq!(next_exit(&mut second).await, ProcessExit::Exited(Some(2)));
    assert!(first.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_binary_reports_launch_failure() {
    let helper = HelperProcess::new("missing", "/nonexistent/ss-local");
    let mut exits = exit_channel(&helper);

    helper.launch(vec![]);

    assert!(matches!(
        next_exit(&mut exits).await,
        ProcessExit::LaunchFailed(_)
    ));
    // Nothing left to stop.
    helper.stop();
    assert_quiet(&mut exits).await;
}

#[tokio::test]
async fn test_non_utf8_stderr_does_not_kill_helper() {
    // Given: a helper that logs a line that is not valid UTF-8
    let helper = shell();
    let mut exits = exit_channel(&helper);

    // When: it keeps logging afterwards
    helper.launch(script(
        "printf 'bad \\377 byte\\n' >&2; sleep 1; echo 'later log line' >&2; exit 7",
    ));

    // Then: it exits on its own terms, not from a broken pipe
    assert_eq!(next_exit(&mut exits).await, ProcessExit::Exited(Some(7)));
}
