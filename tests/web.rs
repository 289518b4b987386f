// tests/web.rs
//
// HTTP surface: routes, Range downloads, deletion, path traversal.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use tempfile::TempDir;

use bbsyncer::fc::FcInfo;
use bbsyncer::storage::manifest::write_manifest;
use bbsyncer::storage::RAW_FLASH_FILENAME;
use bbsyncer::sync::StatusHandle;
use bbsyncer::web::WebServer;

fn fc_info() -> FcInfo {
    FcInfo {
        api_major: 1,
        api_minor: 46,
        variant: *b"BTFL",
        uid: "cafebabe000011112222".to_string(),
        blackbox_device: 1,
    }
}

/// Storage with one session holding a 1024-byte bbl; returns the id.
fn make_fixture(root: &Path) -> (String, Vec<u8>) {
    let session = root
        .join("fc_BTFL_uid-cafebabe")
        .join("2026-07-30_120000");
    fs::create_dir_all(&session).unwrap();
    let data: Vec<u8> = (0u32..1024).map(|i| (i % 251) as u8).collect();
    fs::write(session.join(RAW_FLASH_FILENAME), &data).unwrap();
    write_manifest(&session, &fc_info(), "feedface", data.len() as u64, true, true).unwrap();
    ("fc_BTFL_uid-cafebabe/2026-07-30_120000".to_string(), data)
}

fn start_server(root: &Path) -> (WebServer, String) {
    let server = WebServer::bind("127.0.0.1:0", root.to_path_buf(), StatusHandle::new()).unwrap();
    let base = format!("http://127.0.0.1:{}", server.port());
    let background = server.clone();
    std::thread::spawn(move || background.serve());
    (server, base)
}

// ---------------------------------------------------------------------------

#[test]
fn index_lists_sessions() {
    let tmp = TempDir::new().unwrap();
    let (session_id, _) = make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());

    let resp = ureq::get(&base).call().unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.content_type().starts_with("text/html"));
    let body = resp.into_string().unwrap();
    assert!(body.contains("Betaflight Blackbox Syncer"));
    assert!(body.contains(&session_id));
    assert!(body.contains("Erased"));
}

#[test]
fn sessions_json() {
    let tmp = TempDir::new().unwrap();
    let (session_id, data) = make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());

    let resp = ureq::get(&format!("{}/sessions", base)).call().unwrap();
    assert_eq!(resp.content_type(), "application/json");
    let sessions: serde_json::Value = resp.into_json().unwrap();
    let list = sessions.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["session_id"], session_id);
    assert_eq!(list[0]["manifest"]["file"]["bytes"], data.len() as u64);
    assert_eq!(list[0]["manifest"]["erase_completed"], true);
}

#[test]
fn status_json() {
    let tmp = TempDir::new().unwrap();
    let (_server, base) = start_server(tmp.path());

    let status: serde_json::Value = ureq::get(&format!("{}/status", base))
        .call()
        .unwrap()
        .into_json()
        .unwrap();
    assert_eq!(status["state"], "idle");
    assert_eq!(status["progress"], 0);
}

#[test]
fn full_download() {
    let tmp = TempDir::new().unwrap();
    let (session_id, data) = make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());

    let resp = ureq::get(&format!("{}/download/{}/raw_flash.bbl", base, session_id))
        .call()
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.content_type(), "application/octet-stream");
    assert_eq!(resp.header("Accept-Ranges"), Some("bytes"));
    let mut body = Vec::new();
    resp.into_reader().read_to_end(&mut body).unwrap();
    assert_eq!(body, data);
}

#[test]
fn range_download() {
    let tmp = TempDir::new().unwrap();
    let (session_id, data) = make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());

    let resp = ureq::get(&format!("{}/download/{}/raw_flash.bbl", base, session_id))
        .set("Range", "bytes=100-199")
        .call()
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.header("Content-Range"), Some("bytes 100-199/1024"));
    let mut body = Vec::new();
    resp.into_reader().read_to_end(&mut body).unwrap();
    assert_eq!(body, &data[100..200]);
}

#[test]
fn open_ended_range() {
    let tmp = TempDir::new().unwrap();
    let (session_id, data) = make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());

    let resp = ureq::get(&format!("{}/download/{}/raw_flash.bbl", base, session_id))
        .set("Range", "bytes=1000-")
        .call()
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.header("Content-Range"), Some("bytes 1000-1023/1024"));
    let mut body = Vec::new();
    resp.into_reader().read_to_end(&mut body).unwrap();
    assert_eq!(body, &data[1000..]);
}

#[test]
fn unsatisfiable_range_is_416() {
    let tmp = TempDir::new().unwrap();
    let (session_id, _) = make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());

    let err = ureq::get(&format!("{}/download/{}/raw_flash.bbl", base, session_id))
        .set("Range", "bytes=5000-6000")
        .call()
        .unwrap_err();
    match err {
        ureq::Error::Status(code, resp) => {
            assert_eq!(code, 416);
            assert_eq!(resp.header("Content-Range"), Some("bytes */1024"));
        }
        other => panic!("expected status error, got {}", other),
    }
}

#[test]
fn manifest_download() {
    let tmp = TempDir::new().unwrap();
    let (session_id, _) = make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());

    let resp = ureq::get(&format!("{}/download/{}/manifest.json", base, session_id))
        .call()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.into_string().unwrap();
    assert!(body.contains("\"sha256\": \"feedface\""));
}

#[test]
fn captive_portal_probes_redirect() {
    let tmp = TempDir::new().unwrap();
    let (_server, base) = start_server(tmp.path());

    for probe in [
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/library/test/success.html",
        "/connecttest.txt",
        "/ncsi.txt",
    ] {
        let resp = ureq::get(&format!("{}{}", base, probe)).call().unwrap();
        assert_eq!(resp.status(), 200, "probe {}", probe);
        let body = resp.into_string().unwrap();
        assert!(body.contains("url=/"), "probe {} body: {}", probe, body);
    }
}

#[test]
fn unknown_route_is_404() {
    let tmp = TempDir::new().unwrap();
    let (_server, base) = start_server(tmp.path());
    let err = ureq::get(&format!("{}/nope", base)).call().unwrap_err();
    assert!(matches!(err, ureq::Error::Status(404, _)));
}

#[test]
fn delete_session_removes_directory() {
    let tmp = TempDir::new().unwrap();
    let (session_id, _) = make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());

    let resp = ureq::delete(&format!("{}/sessions/{}", base, session_id))
        .call()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["deleted"], true);
    assert!(!tmp
        .path()
        .join("fc_BTFL_uid-cafebabe/2026-07-30_120000")
        .exists());

    // Cache was invalidated: the listing is empty straight away.
    let sessions: serde_json::Value = ureq::get(&format!("{}/sessions", base))
        .call()
        .unwrap()
        .into_json()
        .unwrap();
    assert_eq!(sessions.as_array().unwrap().len(), 0);
}

#[test]
fn delete_missing_session_is_404() {
    let tmp = TempDir::new().unwrap();
    make_fixture(tmp.path());
    let (_server, base) = start_server(tmp.path());
    let err = ureq::delete(&format!("{}/sessions/fc_BTFL_uid-cafebabe/2000-01-01_000000", base))
        .call()
        .unwrap_err();
    assert!(matches!(err, ureq::Error::Status(404, _)));
}

#[test]
fn path_traversal_is_rejected() {
    let tmp = TempDir::new().unwrap();
    make_fixture(tmp.path());
    let (server, base) = start_server(tmp.path());

    // HTTP clients normalize dot segments, so speak raw HTTP for this one.
    let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    stream
        .write_all(
            b"DELETE /sessions/../etc/passwd HTTP/1.1\r\n\
              Host: localhost\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(
        response.starts_with("HTTP/1.1 400"),
        "got: {}",
        response.lines().next().unwrap_or("")
    );

    // Nothing was removed.
    assert!(tmp
        .path()
        .join("fc_BTFL_uid-cafebabe/2026-07-30_120000")
        .exists());

    // Single-component and over-long ids are rejected the same way.
    let err = ureq::delete(&format!("{}/sessions/onlyonepart", base))
        .call()
        .unwrap_err();
    assert!(matches!(err, ureq::Error::Status(400, _)));
}
