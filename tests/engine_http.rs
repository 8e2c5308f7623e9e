//! End-to-end engine scenarios against a mock HTTP origin

mod common;

use common::{RangeResponder, ctx, engine_in, payload, sha256_hex};
use std::path::PathBuf;
use throttle_dl::disk_writer::part_path;
use throttle_dl::engine::meta_path;
use throttle_dl::{DownloadSpec, EngineOutcome, Error, TransportError};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn single_stream_http_download() {
    let server = MockServer::start().await;
    let body = payload(1_048_576);
    Mock::given(method("HEAD"))
        .and(path("/1MB.bin"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("content-length", body.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1MB.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let spec = DownloadSpec::new(
        Url::parse(&format!("{}/1MB.bin", server.uri())).unwrap(),
        PathBuf::from("a.bin"),
    );

    let outcome = engine.run(&spec, &ctx()).await.unwrap();
    let dest = dir.path().join("a.bin");
    assert_eq!(outcome, EngineOutcome::Completed(dest.clone()));

    let on_disk = tokio::fs::read(&dest).await.unwrap();
    assert_eq!(on_disk.len(), 1_048_576);
    assert_eq!(sha256_hex(&on_disk), sha256_hex(&body));
    assert!(!meta_path(&dest).exists(), ".meta must be cleaned up");
    assert!(!part_path(&dest).exists(), ".part must be cleaned up");
}

#[tokio::test]
async fn parallel_ranges_match_single_stream() {
    let server = MockServer::start().await;
    let body = payload(4 * 1024 * 1024);
    Mock::given(method("HEAD"))
        .and(path("/4MB.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", body.len().to_string())
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/4MB.bin"))
        .respond_with(RangeResponder { body: body.clone() })
        .expect(4) // four sub-ranges, one request each
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let mut spec = DownloadSpec::new(
        Url::parse(&format!("{}/4MB.bin", server.uri())).unwrap(),
        PathBuf::from("parallel.bin"),
    );
    spec.thread_count_hint = 4;

    engine.run(&spec, &ctx()).await.unwrap();

    let on_disk = tokio::fs::read(dir.path().join("parallel.bin")).await.unwrap();
    assert_eq!(
        sha256_hex(&on_disk),
        sha256_hex(&body),
        "ordered concatenation must match the origin byte-for-byte"
    );
    server.verify().await;
}

#[tokio::test]
async fn failing_range_fails_the_download() {
    let server = MockServer::start().await;
    let body = payload(4 * 1024 * 1024);
    Mock::given(method("HEAD"))
        .and(path("/flaky.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", body.len().to_string())
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;
    // Every range request fails; the engine's single fallback retry fails
    // too, so the record must fail rather than publish a hole-ridden file.
    Mock::given(method("GET"))
        .and(path("/flaky.bin"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let mut spec = DownloadSpec::new(
        Url::parse(&format!("{}/flaky.bin", server.uri())).unwrap(),
        PathBuf::from("flaky.bin"),
    );
    spec.thread_count_hint = 4;

    let err = engine.run(&spec, &ctx()).await.unwrap_err();
    assert!(
        matches!(
            err,
            Error::Transport(TransportError::EmptyRange { .. })
        ),
        "got {err:?}"
    );
    let dest = dir.path().join("flaky.bin");
    assert!(!dest.exists(), "failed downloads never publish a dest");
    assert!(!part_path(&dest).exists());
    assert!(!meta_path(&dest).exists());
}

#[tokio::test]
async fn truncated_stream_is_detected() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/short.bin"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-length", "1000000"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/short.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 1000]))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let spec = DownloadSpec::new(
        Url::parse(&format!("{}/short.bin", server.uri())).unwrap(),
        PathBuf::from("short.bin"),
    );
    let err = engine.run(&spec, &ctx()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Transport(TransportError::Truncated { .. })
    ));
}

#[tokio::test]
async fn throttled_download_respects_rate_bound() {
    let server = MockServer::start().await;
    let body = payload(200 * 1024);
    Mock::given(method("HEAD"))
        .and(path("/t.bin"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("content-length", body.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/t.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let mut spec = DownloadSpec::new(
        Url::parse(&format!("{}/t.bin", server.uri())).unwrap(),
        PathBuf::from("t.bin"),
    );
    // 200 KiB at 400 KiB/s: at least ~0.4 s of cooperative pacing
    spec.mode = throttle_dl::Mode::Manual;
    spec.bandwidth_override = Some(400 * 1024);
    spec.chunk_size_hint = Some(64 * 1024);

    let start = std::time::Instant::now();
    engine.run(&spec, &ctx()).await.unwrap();
    let elapsed = start.elapsed();
    assert!(
        elapsed >= std::time::Duration::from_millis(300),
        "manual throttle should have paced the write, took {elapsed:?}"
    );
}
