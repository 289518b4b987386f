// src/web.rs
//
// =============================================================================
// BBSYNCER: WEB UI
// =============================================================================
//
// Read-only HTTP surface for the pilot's phone on the field hotspot:
//
//   GET    /                          session browser (HTML)
//   GET    /sessions                  JSON: all sessions
//   GET    /status                    JSON: current sync status
//   GET    /download/<id>/raw_flash.bbl    (Range-capable)
//   GET    /download/<id>/manifest.json
//   DELETE /sessions/<id>             remove a session
//   GET    /generate_204 etc.         captive portal probes -> redirect to /
//
// Downloads support HTTP Range requests: .bbl files reach tens of MB and
// phone browsers resume over the flaky hotspot link.
//
// A small fixed pool of worker threads shares one tiny_http server. The
// handlers only ever read sync state; nothing here writes it.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

use crate::disk;
use crate::storage::manifest::{list_sessions, SessionEntry};
use crate::storage::{MANIFEST_FILENAME, RAW_FLASH_FILENAME};
use crate::sync::StatusHandle;

const WORKER_THREADS: usize = 4;
const SESSIONS_CACHE_TTL: Duration = Duration::from_secs(10);

const CAPTIVE_PATHS: &[&str] = &[
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/library/test/success.html",
    "/connecttest.txt",
    "/ncsi.txt",
];

const CAPTIVE_HTML: &str = "<!DOCTYPE html><html><head>\
<meta http-equiv=\"refresh\" content=\"0; url=/\">\
<title>Betaflight Blackbox Syncer</title>\
</head><body>\
<p>Redirecting to <a href=\"/\">Blackbox Syncer</a>...</p>\
</body></html>";

// ============================================================================
// 1. SERVER SETUP
// ============================================================================

struct ServerState {
    storage: PathBuf,
    status: StatusHandle,
    // (refreshed_at, entries); refreshed at most every 10s so captive
    // portal probes don't hammer the SD card.
    sessions_cache: Mutex<Option<(Instant, Vec<SessionEntry>)>>,
}

#[derive(Clone)]
pub struct WebServer {
    server: Arc<Server>,
    state: Arc<ServerState>,
}

impl WebServer {
    pub fn bind(addr: &str, storage: PathBuf, status: StatusHandle) -> Result<Self> {
        let server = Server::http(addr).map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;
        log::info!("Web server listening on {}", addr);
        Ok(WebServer {
            server: Arc::new(server),
            state: Arc::new(ServerState {
                storage,
                status,
                sessions_cache: Mutex::new(None),
            }),
        })
    }

    /// Actual bound port (useful when binding port 0).
    pub fn port(&self) -> u16 {
        self.server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// Serve requests forever on a small thread pool. Blocks the calling
    /// thread as the last pool member.
    pub fn serve(&self) {
        for i in 1..WORKER_THREADS {
            let worker = self.clone();
            let _ = std::thread::Builder::new()
                .name(format!("web-{}", i))
                .spawn(move || worker.worker_loop());
        }
        self.worker_loop();
    }

    fn worker_loop(&self) {
        loop {
            match self.server.recv() {
                Ok(request) => self.handle(request),
                Err(e) => {
                    log::error!("Web server accept failed: {}", e);
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    fn handle(&self, request: Request) {
        let method = request.method().clone();
        let path = request
            .url()
            .split('?')
            .next()
            .unwrap_or("")
            .to_string();
        let range_header = request
            .headers()
            .iter()
            .find(|h| h.field.equiv("Range"))
            .map(|h| h.value.as_str().to_string());

        log::debug!("{} {}", method, path);

        let result = match method {
            Method::Get => self.handle_get(request, &path, range_header),
            Method::Delete => self.handle_delete(request, &path),
            _ => send_error(request, 404),
        };
        if let Err(e) = result {
            log::debug!("Error responding to {}: {}", path, e);
        }
    }

    fn handle_get(
        &self,
        request: Request,
        path: &str,
        range_header: Option<String>,
    ) -> std::io::Result<()> {
        if CAPTIVE_PATHS.contains(&path) {
            return send_html(request, CAPTIVE_HTML.to_string());
        }
        match path {
            "/" => send_html(request, self.render_index()),
            "/sessions" => send_json(request, &self.sessions()),
            "/status" => send_json(request, &self.state.status.snapshot()),
            _ => {
                if let Some(rest) = path.strip_prefix("/download/") {
                    self.handle_download(request, rest, range_header)
                } else {
                    send_error(request, 404)
                }
            }
        }
    }

    fn handle_download(
        &self,
        request: Request,
        sub_path: &str,
        range_header: Option<String>,
    ) -> std::io::Result<()> {
        let filename = if sub_path.ends_with(&format!("/{}", RAW_FLASH_FILENAME)) {
            RAW_FLASH_FILENAME
        } else if sub_path.ends_with(&format!("/{}", MANIFEST_FILENAME)) {
            MANIFEST_FILENAME
        } else {
            return send_error(request, 404);
        };
        let session_id = &sub_path[..sub_path.len() - filename.len() - 1];

        let session_path = match resolve_session_path(&self.state.storage, session_id) {
            Ok(path) => path,
            Err(code) => return send_error(request, code),
        };
        let file_path = session_path.join(filename);
        if !file_path.is_file() {
            return send_error(request, 404);
        }
        send_file(request, &file_path, filename, range_header)
    }

    fn handle_delete(&self, request: Request, path: &str) -> std::io::Result<()> {
        let Some(session_id) = path.strip_prefix("/sessions/") else {
            return send_error(request, 404);
        };
        let session_path = match resolve_session_path(&self.state.storage, session_id) {
            Ok(path) => path,
            Err(code) => return send_error(request, code),
        };
        if let Err(e) = fs::remove_dir_all(&session_path) {
            log::error!("Failed to delete {}: {}", session_path.display(), e);
            return send_error(request, 500);
        }
        *self.state.sessions_cache.lock().unwrap() = None; // invalidate
        log::info!("Deleted session: {}", session_path.display());
        send_json(
            request,
            &serde_json::json!({ "deleted": true, "session_id": session_id }),
        )
    }

    // ------------------------------------------------------------------
    // Session cache
    // ------------------------------------------------------------------

    fn sessions(&self) -> Vec<SessionEntry> {
        let mut cache = self.state.sessions_cache.lock().unwrap();
        if let Some((refreshed_at, entries)) = cache.as_ref() {
            if refreshed_at.elapsed() < SESSIONS_CACHE_TTL {
                return entries.clone();
            }
        }
        let entries = if self.state.storage.exists() {
            list_sessions(&self.state.storage)
        } else {
            Vec::new()
        };
        *cache = Some((Instant::now(), entries.clone()));
        entries
    }

    // ------------------------------------------------------------------
    // Index page
    // ------------------------------------------------------------------

    fn render_index(&self) -> String {
        let sessions = self.sessions();
        let (used_gb, free_gb) = disk::used_and_free_gb(&self.state.storage).unwrap_or((0.0, 0.0));
        let total_gb = used_gb + free_gb;
        let pct = if total_gb > 0.0 {
            (used_gb / total_gb * 100.0) as u32
        } else {
            0
        };
        format!(
            include_str!("web/index.html"),
            used_gb = used_gb,
            free_gb = free_gb,
            pct = pct,
            sessions = render_sessions(&sessions),
        )
    }
}

// ============================================================================
// 2. PATH SAFETY
// ============================================================================

/// Resolve "fc_dir/session_dir" strictly inside the storage root.
/// Malformed ids are 400, missing sessions 404.
fn resolve_session_path(storage: &Path, session_id: &str) -> std::result::Result<PathBuf, u16> {
    let parts: Vec<&str> = session_id.split('/').collect();
    if parts.len() != 2 || parts.iter().any(|p| p.is_empty() || p.contains("..")) {
        return Err(400);
    }
    let storage_canonical = storage.canonicalize().map_err(|_| 404u16)?;
    let candidate = storage_canonical.join(parts[0]).join(parts[1]);
    if !candidate.exists() {
        return Err(404);
    }
    // Canonicalize again so a symlink inside the tree cannot escape it.
    let resolved = candidate.canonicalize().map_err(|_| 404u16)?;
    if !resolved.starts_with(&storage_canonical) {
        return Err(400);
    }
    Ok(resolved)
}

// ============================================================================
// 3. RESPONSE HELPERS
// ============================================================================

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("static header")
}

// Response::from_data carries no implicit Content-Type, so the ones set
// here are the only ones on the wire.

fn send_html(request: Request, body: String) -> std::io::Result<()> {
    let response = Response::from_data(body.into_bytes())
        .with_header(header("Content-Type", "text/html; charset=utf-8"));
    request.respond(response)
}

fn send_json<T: serde::Serialize>(request: Request, data: &T) -> std::io::Result<()> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "null".to_string());
    let response = Response::from_data(body.into_bytes())
        .with_header(header("Content-Type", "application/json"));
    request.respond(response)
}

fn send_error(request: Request, code: u16) -> std::io::Result<()> {
    let response = Response::from_data(format!("{} Error\n", code).into_bytes())
        .with_status_code(StatusCode(code))
        .with_header(header("Content-Type", "text/plain"));
    request.respond(response)
}

/// Full or partial file download. Range grammar: `bytes=<start>-<end>`
/// with either side optional; unsatisfiable ranges answer 416.
fn send_file(
    request: Request,
    path: &Path,
    filename: &str,
    range_header: Option<String>,
) -> std::io::Result<()> {
    let size = fs::metadata(path)?.len();
    let disposition = format!("attachment; filename=\"{}\"", filename);

    if let Some(spec) = range_header.as_deref().and_then(parse_range) {
        let (start, end_req) = spec;
        let end = end_req.unwrap_or(size.saturating_sub(1)).min(size.saturating_sub(1));
        if start > end || start >= size {
            let response = Response::empty(StatusCode(416))
                .with_header(header("Content-Range", &format!("bytes */{}", size)));
            return request.respond(response);
        }
        let length = end - start + 1;
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        let reader = file.take(length);
        let response = Response::new(
            StatusCode(206),
            vec![
                header("Content-Type", "application/octet-stream"),
                header("Content-Disposition", &disposition),
                header("Content-Range", &format!("bytes {}-{}/{}", start, end, size)),
                header("Accept-Ranges", "bytes"),
            ],
            reader,
            Some(length as usize),
            None,
        );
        return request.respond(response);
    }

    let file = File::open(path)?;
    let response = Response::new(
        StatusCode(200),
        vec![
            header("Content-Type", "application/octet-stream"),
            header("Content-Disposition", &disposition),
            header("Accept-Ranges", "bytes"),
        ],
        file,
        Some(size as usize),
        None,
    );
    request.respond(response)
}

/// Parse a Range header into (start, Option<end>). Anything malformed is
/// ignored and the whole file is served, matching lenient server practice.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let start = if start_str.is_empty() {
        0
    } else {
        start_str.parse().ok()?
    };
    let end = if end_str.is_empty() {
        None
    } else {
        Some(end_str.parse().ok()?)
    };
    Some((start, end))
}

// ============================================================================
// 4. HTML RENDERING
// ============================================================================

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

fn render_sessions(sessions: &[SessionEntry]) -> String {
    if sessions.is_empty() {
        return "<div class=\"empty-state\">\
                <p>No sessions yet.<br>Plug in a Betaflight FC to start syncing.</p>\
                </div>"
            .to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    let mut current_fc: Option<&str> = None;

    for session in sessions {
        if current_fc != Some(session.fc_dir.as_str()) {
            if current_fc.is_some() {
                parts.push("</div></details>".to_string());
            }
            current_fc = Some(session.fc_dir.as_str());
            parts.push(format!(
                "<details class=\"fc-group\" open><summary>{}</summary><div>",
                escape(&session.fc_dir)
            ));
        }

        let m = &session.manifest;
        let file_mb = m.file.bytes as f64 / 1048576.0;
        let (erased_cls, erased_txt) = if m.erase_completed {
            ("erased", "Erased")
        } else {
            ("no-erase", "Not erased")
        };
        let sha_html = if m.file.sha256.is_empty() {
            String::new()
        } else {
            format!(
                "<span title=\"{}\">SHA-256: {}&hellip;</span>",
                escape(&m.file.sha256),
                escape(&m.file.sha256[..m.file.sha256.len().min(12)])
            )
        };
        let bbl_html = if session.bbl_path.is_some() {
            format!(
                "<a class=\"btn\" href=\"/download/{}/raw_flash.bbl\">Download .bbl</a>",
                escape(&session.session_id)
            )
        } else {
            String::new()
        };

        parts.push(format!(
            "<div class=\"session-card\">\
             <div class=\"session-header\">\
             <span class=\"session-title\">{title}</span>\
             <span class=\"badge {ecls}\">{etxt}</span>\
             </div>\
             <div class=\"session-meta\"><span>{mb:.1} MB</span><span>API {api}</span>{sha}</div>\
             <div class=\"session-actions\">{bbl}\
             <a class=\"btn\" href=\"/download/{id}/manifest.json\">Manifest</a>\
             <button class=\"btn-delete\" onclick=\"deleteSession('{id}', this)\">Delete</button>\
             </div></div>",
            title = escape(&session.session_dir.replace('_', " ")),
            ecls = erased_cls,
            etxt = erased_txt,
            mb = file_mb,
            api = escape(&m.fc.api_version),
            sha = sha_html,
            bbl = bbl_html,
            id = escape(&session.session_id),
        ));
    }
    parts.push("</div></details>".to_string());
    parts.join("\n")
}
