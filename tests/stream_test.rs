//! Integration tests for the streamed relay (`GET /stream`).

mod common;

use std::time::Duration;

use common::{wait_for_state, TestHarness};

#[tokio::test]
async fn missing_url_is_400() {
    let (_h, addr) = TestHarness::with_server(Some("exit 0"), None).await;

    for query in ["", "?url=", "?url=%20%20", "?format=progressive"] {
        let resp = reqwest::get(format!("http://{addr}/stream{query}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "query {query:?}");
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["error"], "Stream URL is required");
    }
}

#[tokio::test]
async fn unknown_format_is_400() {
    let (_h, addr) = TestHarness::with_server(Some("exit 0"), None).await;

    let resp = reqwest::get(format!("http://{addr}/stream?url=rtsp://cam&format=webm"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn segmented_format_is_not_streamable() {
    let (_h, addr) = TestHarness::with_server(Some("exit 0"), None).await;

    let resp = reqwest::get(format!(
        "http://{addr}/stream?url=rtsp://cam&format=segmented"
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn relays_transcoder_output() {
    let (_h, addr) = TestHarness::with_server(Some("printf 'hello-'; printf 'relay'"), None).await;

    let resp = reqwest::get(format!("http://{addr}/stream?url=rtsp://cam/live"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "video/mp4"
    );
    assert_eq!(
        resp.headers().get("cache-control").unwrap().to_str().unwrap(),
        "no-cache"
    );
    let id = resp
        .headers()
        .get("x-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], b"hello-relay");

    let session = wait_for_state(addr, &id, "closed").await;
    assert_eq!(session["bytesDelivered"], 11);
    assert_eq!(session["exitCode"], 0);
}

#[tokio::test]
async fn legacy_format_uses_mpegts() {
    let (_h, addr) = TestHarness::with_server(Some("printf ts"), None).await;

    let resp = reqwest::get(format!(
        "http://{addr}/stream?url=rtsp://cam&format=legacy-packetized"
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "video/mp2t"
    );
    assert_eq!(&resp.bytes().await.unwrap()[..], b"ts");
}

#[tokio::test]
async fn default_format_uses_stored_quality() {
    // Echo the argument vector back as the "stream".
    let (_h, addr) = TestHarness::with_server(Some(r#"echo "$@""#), None).await;

    let resp = reqwest::get(format!("http://{addr}/stream?url=rtsp://cam/live"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let args = resp.text().await.unwrap();

    assert!(args.contains("-i rtsp://cam/live"), "{args}");
    assert!(args.contains("-crf 23 -maxrate 1000k -bufsize 1024k"), "{args}");
    assert!(args.trim_end().ends_with("pipe:1"), "{args}");
}

#[tokio::test]
async fn launch_failure_is_500() {
    let (_h, addr) = TestHarness::with_server(None, None).await;

    let resp = reqwest::get(format!("http://{addr}/stream?url=rtsp://cam/live"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "FFmpeg process failed to start");
}

#[tokio::test]
async fn failure_after_data_closes_stream() {
    let (_h, addr) = TestHarness::with_server(Some("printf partial; exit 1"), None).await;

    let resp = reqwest::get(format!("http://{addr}/stream?url=rtsp://cam/live"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let id = resp
        .headers()
        .get("x-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(&resp.bytes().await.unwrap()[..], b"partial");

    let session = wait_for_state(addr, &id, "failed").await;
    assert_eq!(session["exitCode"], 1);
}

#[tokio::test]
async fn client_disconnect_stops_transcoder() {
    let h = TestHarness::with_tools(None, None);
    let pid_file = h.path("ffmpeg.pid");
    common::write_script(
        &h.ctx.config.tools.ffmpeg,
        &format!(
            "echo $$ > {}\nwhile true; do echo frame; sleep 0.05; done",
            pid_file.display()
        ),
    );
    let (h, addr) = h.serve().await;

    let mut resp = reqwest::get(format!("http://{addr}/stream?url=rtsp://cam/live"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let id = resp
        .headers()
        .get("x-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(resp.chunk().await.unwrap().is_some());
    drop(resp);

    wait_for_state(addr, &id, "closed").await;

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
    assert!(!alive, "transcoder {pid} still running");
    assert_eq!(h.ctx.sessions.active_count(), 0);
}

#[tokio::test]
async fn delete_cancels_live_stream() {
    let (h, addr) = TestHarness::with_server(
        Some("while true; do echo frame; sleep 0.05; done"),
        None,
    )
    .await;
    let client = reqwest::Client::new();

    let mut resp = client
        .get(format!("http://{addr}/stream?url=rtsp://cam/live"))
        .send()
        .await
        .unwrap();
    let id = resp
        .headers()
        .get("x-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(resp.chunk().await.unwrap().is_some());

    let cancel = client
        .delete(format!("http://{addr}/sessions/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(cancel.status(), 200);

    // The body ends once the process is gone.
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = resp.chunk().await {}
    })
    .await;
    assert!(rest.is_ok());

    wait_for_state(addr, &id, "closed").await;

    // Cancelling again is a no-op.
    let again = client
        .delete(format!("http://{addr}/sessions/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 200);
    let json: serde_json::Value = again.json().await.unwrap();
    assert_eq!(json["state"], "closed");
    assert_eq!(h.ctx.sessions.active_count(), 0);
}
