//! End-to-end poll cycles against a mock collector.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use log_broadcast::broadcaster::BroadcastError;
use log_broadcast::config::Config;
use log_broadcast::offset::Reconciliation;
use log_broadcast::pipeline::{PipelineError, Tailer};
use mockito::{Matcher, Server};

/// A log line of exactly `len` bytes, newline included.
fn line(id: &str, len: usize) -> String {
    let prefix = format!(r#"{{"id":"{}","pad":""#, id);
    let pad = len - prefix.len() - 3;
    format!("{}{}\"}}\n", prefix, "x".repeat(pad))
}

fn append(path: &Path, contents: &str) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
}

fn config_for(url: &str, log: &Path) -> Config {
    let mut config = Config::new(url, log);
    config.request_timeout = Duration::from_secs(5);
    config
}

#[test]
fn test_line_helper_lengths() {
    assert_eq!(line("one", 252).len(), 252);
    assert_eq!(line("two", 251).len(), 251);
}

#[tokio::test]
async fn test_first_cycle_delivers_whole_log() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("content-type", "application/json; charset=utf-8")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""schema":"good.v1""#.to_string()),
            Matcher::Regex(r#""id":"one""#.to_string()),
            Matcher::Regex(r#""id":"two""#.to_string()),
        ]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, line("one", 252) + &line("two", 251)).unwrap();

    let mut tailer = Tailer::new(config_for(&server.url(), &log)).unwrap();
    let report = tailer.poll_once().await.unwrap();

    assert_eq!(report.start_offset, 0);
    assert_eq!(report.bytes_consumed, 503);
    assert_eq!(report.end_offset, 503);
    assert_eq!(report.events_read, 2);
    assert_eq!(report.batches_sent, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_resume_from_persisted_offset() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::Regex(r#""id":"two""#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    let resume = dir.path().join("app.offset");
    std::fs::write(&log, line("one", 252) + &line("two", 251)).unwrap();
    std::fs::write(&resume, "252").unwrap();

    let mut config = config_for(&server.url(), &log);
    config.resume_path = Some(resume.clone());

    let mut tailer = Tailer::new(config).unwrap();
    let report = tailer.poll_once().await.unwrap();

    assert_eq!(report.start_offset, 252);
    assert_eq!(report.events_read, 1);
    assert_eq!(report.batches_sent, 1);
    assert_eq!(std::fs::read_to_string(&resume).unwrap(), "503");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_oversized_line_dropped_rest_delivered() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::Regex(r#""id":"small""#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    // 254 bytes of JSON plus the newline
    std::fs::write(&log, line("big", 255) + &line("small", 40)).unwrap();

    let mut config = config_for(&server.url(), &log);
    config.max_size = 253;

    let mut tailer = Tailer::new(config).unwrap();
    let report = tailer.poll_once().await.unwrap();

    assert_eq!(report.events_read, 2);
    assert_eq!(report.events_dropped, 1);
    assert_eq!(report.batches_sent, 1);
    assert_eq!(report.end_offset, 295);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_collector_exhausts_attempts() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    let resume = dir.path().join("app.offset");
    std::fs::write(&log, line("one", 100)).unwrap();

    let mut config = config_for(&url, &log);
    config.attempts = 3;
    config.wait = Duration::from_millis(1000);
    config.resume_path = Some(resume.clone());

    let mut tailer = Tailer::new(config).unwrap();
    let started = Instant::now();
    let result = tailer.poll_once().await;

    assert!(matches!(
        result,
        Err(PipelineError::Broadcast(BroadcastError::RetriesExhausted {
            attempts: 3,
            ..
        }))
    ));
    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert_eq!(tailer.broadcaster().stats().attempts, 3);

    // The offset is persisted even though delivery failed
    assert_eq!(std::fs::read_to_string(&resume).unwrap(), "100");
}

#[tokio::test]
async fn test_growing_log_sends_only_new_lines() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, line("one", 60)).unwrap();

    let mut tailer = Tailer::new(config_for(&server.url(), &log)).unwrap();
    let first = tailer.poll_once().await.unwrap();
    assert_eq!(first.events_read, 1);

    // A half-written line is held back until it is complete
    let second_line = line("two", 60);
    append(&log, &second_line[..30]);
    let partial = tailer.poll_once().await.unwrap();
    assert_eq!(partial.events_read, 0);
    assert_eq!(partial.batches_sent, 0);
    assert_eq!(partial.end_offset, 60);

    append(&log, &second_line[30..]);
    let second = tailer.poll_once().await.unwrap();
    assert_eq!(second.start_offset, 60);
    assert_eq!(second.events_read, 1);
    assert_eq!(second.end_offset, 120);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_truncated_log_restarts_from_zero() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, line("one", 80) + &line("two", 80)).unwrap();

    let mut tailer = Tailer::new(config_for(&server.url(), &log)).unwrap();
    let first = tailer.poll_once().await.unwrap();
    assert_eq!(first.end_offset, 160);

    std::fs::write(&log, line("three", 50)).unwrap();
    let second = tailer.poll_once().await.unwrap();

    assert_eq!(second.reconciliation, Some(Reconciliation::Truncated));
    assert_eq!(second.start_offset, 0);
    assert_eq!(second.events_read, 1);
    assert_eq!(second.end_offset, 50);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_same_size_replacement_restarts_from_zero() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, line("one", 80)).unwrap();

    let mut tailer = Tailer::new(config_for(&server.url(), &log)).unwrap();
    // First cycle records the snapshot, second sees no change
    assert_eq!(tailer.poll_once().await.unwrap().events_read, 1);
    let idle = tailer.poll_once().await.unwrap();
    assert_eq!(idle.reconciliation, Some(Reconciliation::Unchanged));
    assert_eq!(idle.batches_sent, 0);

    std::fs::write(&log, line("two", 80)).unwrap();
    let file = OpenOptions::new().write(true).open(&log).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();
    drop(file);

    let replaced = tailer.poll_once().await.unwrap();
    assert_eq!(replaced.reconciliation, Some(Reconciliation::Replaced));
    assert_eq!(replaced.start_offset, 0);
    assert_eq!(replaced.events_read, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_restart_resumes_where_previous_run_stopped() {
    let mut server = Server::new_async().await;
    let first_mock = server
        .mock("POST", "/")
        .match_body(Matcher::Regex(r#""id":"one""#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let second_mock = server
        .mock("POST", "/")
        .match_body(Matcher::Regex(r#""id":"two""#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    let resume = dir.path().join("app.offset");
    std::fs::write(&log, line("one", 70)).unwrap();

    let mut config = config_for(&server.url(), &log);
    config.resume_path = Some(resume.clone());

    let mut first_run = Tailer::new(config.clone()).unwrap();
    first_run.poll_once().await.unwrap();
    drop(first_run);
    assert_eq!(std::fs::read_to_string(&resume).unwrap(), "70");

    append(&log, &line("two", 70));

    let mut second_run = Tailer::new(config).unwrap();
    let report = second_run.poll_once().await.unwrap();
    assert_eq!(report.start_offset, 70);
    assert_eq!(report.events_read, 1);

    first_mock.assert_async().await;
    second_mock.assert_async().await;
}

#[tokio::test]
async fn test_new_only_skips_existing_lines() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::Regex(r#""id":"fresh""#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, line("old", 60)).unwrap();

    let mut config = config_for(&server.url(), &log);
    config.new_only = true;

    let mut tailer = Tailer::new(config).unwrap();
    let idle = tailer.poll_once().await.unwrap();
    assert_eq!(idle.start_offset, 59);
    assert_eq!(idle.events_read, 0);

    append(&log, &line("fresh", 60));
    let report = tailer.poll_once().await.unwrap();
    assert_eq!(report.events_read, 1);
    assert_eq!(report.end_offset, 120);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_max_events_splits_into_ordered_batches() {
    let mut server = Server::new_async().await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut mocks = Vec::new();
    for (name, pattern) in [
        ("first", r#""id":"0".*"id":"1""#),
        ("second", r#""id":"2".*"id":"3""#),
        ("third", r#""id":"4""#),
    ] {
        let order = order.clone();
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::Regex(pattern.to_string()))
            .with_status(200)
            .with_body_from_request(move |_| {
                order.lock().unwrap().push(name);
                Vec::new()
            })
            .expect(1)
            .create_async()
            .await;
        mocks.push(mock);
    }

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    let contents: String = (0..5).map(|i| line(&i.to_string(), 40)).collect();
    std::fs::write(&log, contents).unwrap();

    let mut config = config_for(&server.url(), &log);
    config.max_events = 2;

    let mut tailer = Tailer::new(config).unwrap();
    let report = tailer.poll_once().await.unwrap();

    assert_eq!(report.events_read, 5);
    assert_eq!(report.batches_sent, 3);
    assert_eq!(tailer.broadcaster().stats().events_sent, 5);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    for mock in mocks {
        mock.assert_async().await;
    }
}
