//! End-to-end API tests: spawn the real binary on an ephemeral port with a
//! fake engine on disk, then drive the HTTP surface with reqwest.
#![cfg(unix)]

use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

// Each test gets its own port so they can run in parallel.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(9500);

/// Stand-in for you-get: answers --version and --json, otherwise pretends to
/// download forever so stop/restart have something to act on.
const FAKE_ENGINE: &str = r#"#!/bin/sh
case "$1" in
  --version)
    echo "you-get: version 0.4.1650 (fake)"
    exit 0
    ;;
  --json)
    echo '{"site":"FakeTube","title":"Test clip","streams":{"default":{"container":"mp4","size":1000}}}'
    exit 0
    ;;
  *)
    sleep 300
    ;;
esac
"#;

struct TestServer {
    child: Child,
    port: u16,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = tempfile::tempdir().expect("tempdir");

        let engine = dir.path().join("fake-you-get");
        std::fs::write(&engine, FAKE_ENGINE).expect("write fake engine");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755))
                .expect("chmod fake engine");
        }

        let conf = dir.path().join("you-get-web.conf");
        std::fs::write(
            &conf,
            format!(
                "[downloader]\nyou_get_path = {}\nmax_tasks = 2\nmax_retry = 1\n",
                engine.display()
            ),
        )
        .expect("write conf");

        let child = Command::new(env!("CARGO_BIN_EXE_you-get-web"))
            .args([
                "-c",
                &conf.display().to_string(),
                "-d",
                &dir.path().join("data").display().to_string(),
                "-o",
                &dir.path().join("out").display().to_string(),
                "-i",
                "127.0.0.1",
                "-p",
                &port.to_string(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn server");

        let server = Self {
            child,
            port,
            _dir: dir,
        };
        server.wait_ready().await;
        server
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    async fn wait_ready(&self) {
        let client = reqwest::Client::new();
        for _ in 0..100 {
            if client.get(self.url("/api/version")).send().await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("server on port {} never became ready", self.port);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn submit_body(urls: &str) -> serde_json::Value {
    serde_json::json!({ "urls": urls })
}

#[tokio::test]
async fn test_gui_page_and_version() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    // / redirects into the GUI
    let page = client
        .get(server.url("/"))
        .send()
        .await
        .expect("request failed");
    assert!(page.url().path().ends_with("/html/"));
    assert!(page.status().is_success());
    let body = page.text().await.unwrap();
    assert!(body.contains("you-get-web"));
    assert!(body.contains("Add tasks"));

    let version: serde_json::Value = client
        .get(server.url("/api/version"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["name"], "you-get-web");
    assert!(version["version"].as_str().is_some_and(|v| !v.is_empty()));
}

#[tokio::test]
async fn test_submit_and_task_lifecycle() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/api/tasks"))
        .json(&submit_body(
            "https://example.com/v/1\nhttps://example.com/v/2",
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["rejected"], 0);
    let task_id = body["results"][0]["task_id"].as_i64().unwrap();

    // same origin again while active: rejected wholesale
    let resp = client
        .post(server.url("/api/tasks"))
        .json(&submit_body("https://example.com/v/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

    let list: serde_json::Value = client
        .get(server.url("/api/tasks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["tasks"].as_array().unwrap().len(), 2);

    // stop the first task, its row lands in stopped
    let resp = client
        .post(server.url(&format!("/api/tasks/{}/stop", task_id)))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let detail: serde_json::Value = client
        .get(server.url(&format!("/api/tasks/{}", task_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["task"]["status"], "stopped");

    // restart puts it back in play
    let resp = client
        .post(server.url(&format!("/api/tasks/{}/restart", task_id)))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let detail: serde_json::Value = client
        .get(server.url(&format!("/api/tasks/{}", task_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let status = detail["task"]["status"].as_str().unwrap();
    assert!(status == "queued" || status == "running", "status: {}", status);

    // remove deletes the row outright
    let resp = client
        .delete(server.url(&format!("/api/tasks/{}", task_id)))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let resp = client
        .get(server.url(&format!("/api/tasks/{}", task_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_endpoint_counts_slots() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let status: serde_json::Value = client
        .get(server.url("/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["queue"]["max_concurrent"], 2);
    assert_eq!(status["tasks"]["total"], 0);
}

#[tokio::test]
async fn test_media_info_probe() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let info: serde_json::Value = client
        .post(server.url("/api/info"))
        .json(&serde_json::json!({ "url": "https://example.com/v/probe" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["info"]["title"], "Test clip");
    assert_eq!(info["info"]["site"], "FakeTube");
    assert_eq!(info["info"]["streams"][0]["id"], "default");

    // empty URL is refused before the engine runs
    let resp = client
        .post(server.url("/api/info"))
        .json(&serde_json::json!({ "url": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_settings_roundtrip() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .put(server.url("/api/settings"))
        .json(&serde_json::json!({ "output_dir": "/media", "use_proxy": "1" }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let settings: serde_json::Value = client
        .get(server.url("/api/settings"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(settings["settings"]["output_dir"], "/media");
    assert_eq!(settings["settings"]["use_proxy"], "1");
}

#[tokio::test]
async fn test_activity_log_records_submissions() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    client
        .post(server.url("/api/tasks"))
        .json(&submit_body("https://example.com/v/logged"))
        .send()
        .await
        .unwrap();

    let log: serde_json::Value = client
        .get(server.url("/api/log"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = log["entries"].as_array().unwrap();
    assert!(entries
        .iter()
        .any(|e| e["message"].as_str().unwrap().contains("example.com/v/logged")));
}

#[tokio::test]
async fn test_bulk_clear_requires_finished_status() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .delete(server.url("/api/tasks?status=running"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .delete(server.url("/api/tasks?status=done"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["cleared"], 0);
}

#[tokio::test]
async fn test_help_lists_flags_without_starting() {
    let output = Command::new(env!("CARGO_BIN_EXE_you-get-web"))
        .arg("-h")
        .output()
        .expect("run -h");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for flag in [
        "--config",
        "--output-dir",
        "--data-dir",
        "--server-type",
        "--host",
        "--port",
        "--debug",
        "--version",
        "--help",
    ] {
        assert!(text.contains(flag), "usage is missing {}", flag);
    }
}

#[tokio::test]
async fn test_version_flag_prints_and_exits() {
    let output = Command::new(env!("CARGO_BIN_EXE_you-get-web"))
        .arg("--version")
        .output()
        .expect("run --version");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.starts_with("you-get-web"));
}
