//! Director HTTP server: loopback-only accept loop over a shared session
//! store, plus a typed channel of commit/discard events the orchestrator
//! consumes while paused between frames.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::Engine as _;

use crate::director::http::{
    cors_origin, err_envelope, ok_envelope, read_http_request, respond_json, respond_no_content,
    HttpRequest, Method,
};
use crate::director::session::{DirectorFrameStatus, SessionStore};
use crate::errors::display_for_session_error;

#[derive(Clone, PartialEq, Debug)]
pub enum DirectorEvent {
    Commit { session_id: String },
    Discard { session_id: String },
}

pub struct DirectorServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    pub events: Receiver<DirectorEvent>,
}

impl DirectorServer {
    /// Bind 127.0.0.1:`port` (0 picks an ephemeral port) and serve until
    /// stopped. Patch masks are written under `mask_dir`.
    pub fn start(
        store: Arc<Mutex<SessionStore>>,
        mask_dir: PathBuf,
        port: u16,
    ) -> io::Result<DirectorServer> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = std::thread::spawn(move || {
            accept_loop(listener, store, mask_dir, tx, stop_thread);
        });
        tracing::info!(target: "director", %addr, "director server listening");
        Ok(DirectorServer {
            addr,
            stop,
            handle: Some(handle),
            events: rx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for DirectorServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    store: Arc<Mutex<SessionStore>>,
    mask_dir: PathBuf,
    tx: Sender<DirectorEvent>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
                handle_connection(stream, &store, &mask_dir, &tx);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                tracing::warn!(target: "director", error = %e, "accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    store: &Arc<Mutex<SessionStore>>,
    mask_dir: &PathBuf,
    tx: &Sender<DirectorEvent>,
) {
    let req = match read_http_request(&mut stream) {
        Ok(r) => r,
        Err(e) => {
            respond_json(&mut stream, "400 Bad Request", None, &err_envelope(&e.to_string()));
            return;
        }
    };
    let origin = cors_origin(&req.headers);
    let origin_ref = origin.as_deref();

    if req.method == Method::Options {
        respond_no_content(&mut stream, origin_ref);
        return;
    }

    let result = route(&req, store, mask_dir, tx);
    match result {
        RouteResult::Ok(data) => respond_json(&mut stream, "200 OK", origin_ref, &ok_envelope(data)),
        RouteResult::BadRequest(msg) => {
            respond_json(&mut stream, "400 Bad Request", origin_ref, &err_envelope(&msg))
        }
        RouteResult::NotFound => respond_json(
            &mut stream,
            "404 Not Found",
            origin_ref,
            &err_envelope("not found"),
        ),
        RouteResult::Error(msg) => respond_json(
            &mut stream,
            "500 Internal Server Error",
            origin_ref,
            &err_envelope(&msg),
        ),
    }
}

enum RouteResult {
    Ok(serde_json::Value),
    BadRequest(String),
    NotFound,
    Error(String),
}

fn route(
    req: &HttpRequest,
    store: &Arc<Mutex<SessionStore>>,
    mask_dir: &PathBuf,
    tx: &Sender<DirectorEvent>,
) -> RouteResult {
    let path = req.path.split('?').next().unwrap_or("");
    match (&req.method, path) {
        (Method::Get, "/api/session") => {
            let guard = store.lock().expect("session store mutex");
            match serde_json::to_value(guard.session()) {
                Ok(v) => RouteResult::Ok(v),
                Err(e) => RouteResult::Error(e.to_string()),
            }
        }
        (Method::Get, p) if p.starts_with("/api/frame/") => {
            let Some(index) = p
                .trim_start_matches("/api/frame/")
                .parse::<u32>()
                .ok()
            else {
                return RouteResult::BadRequest("frame id must be an integer".into());
            };
            let guard = store.lock().expect("session store mutex");
            match guard
                .session()
                .frames
                .iter()
                .find(|f| f.frame_index == index)
            {
                Some(frame) => match serde_json::to_value(frame) {
                    Ok(v) => RouteResult::Ok(v),
                    Err(e) => RouteResult::Error(e.to_string()),
                },
                None => RouteResult::NotFound,
            }
        }
        (Method::Post, "/api/nudge") => {
            let Ok(body) = serde_json::from_slice::<serde_json::Value>(&req.body) else {
                return RouteResult::BadRequest("body must be JSON".into());
            };
            let (Some(frame), Some(dx), Some(dy)) = (
                body.get("frameId").and_then(|v| v.as_u64()),
                body.get("dx").and_then(|v| v.as_i64()),
                body.get("dy").and_then(|v| v.as_i64()),
            ) else {
                return RouteResult::BadRequest("expected {frameId, dx, dy}".into());
            };
            let mut guard = store.lock().expect("session store mutex");
            match guard.apply_nudge(frame as u32, dx as i32, dy as i32) {
                Ok(merged) => RouteResult::Ok(serde_json::json!({
                    "frameId": frame,
                    "alignment": { "dx": merged.dx, "dy": merged.dy },
                })),
                Err(e) => RouteResult::BadRequest(display_for_session_error(&e)),
            }
        }
        (Method::Post, "/api/patch") => {
            let Ok(body) = serde_json::from_slice::<serde_json::Value>(&req.body) else {
                return RouteResult::BadRequest("body must be JSON".into());
            };
            let (Some(frame), Some(mask_b64), Some(prompt)) = (
                body.get("frameId").and_then(|v| v.as_u64()),
                body.get("maskBase64").and_then(|v| v.as_str()),
                body.get("prompt").and_then(|v| v.as_str()),
            ) else {
                return RouteResult::BadRequest("expected {frameId, maskBase64, prompt}".into());
            };
            let Ok(mask_bytes) = base64::engine::general_purpose::STANDARD.decode(mask_b64)
            else {
                return RouteResult::BadRequest("maskBase64 is not valid base64".into());
            };
            let mut guard = store.lock().expect("session store mutex");
            let n = guard
                .session()
                .frames
                .iter()
                .find(|f| f.frame_index == frame as u32)
                .map(|f| f.director_overrides.patch_history.len())
                .unwrap_or(0);
            let mask_name = format!("patch_{frame:04}_{n:02}.png");
            let mask_path = mask_dir.join(&mask_name);
            if let Err(e) = crate::util::fs::atomic_write(&mask_path, &mask_bytes) {
                return RouteResult::Error(e.to_string());
            }
            match guard.apply_patch(frame as u32, &mask_name, prompt) {
                Ok(()) => RouteResult::Ok(serde_json::json!({
                    "frameId": frame,
                    "maskPath": mask_name,
                })),
                Err(e) => RouteResult::BadRequest(display_for_session_error(&e)),
            }
        }
        (Method::Post, "/api/approve") => {
            let Ok(body) = serde_json::from_slice::<serde_json::Value>(&req.body) else {
                return RouteResult::BadRequest("body must be JSON".into());
            };
            let Some(frame) = body.get("frameId").and_then(|v| v.as_u64()) else {
                return RouteResult::BadRequest("expected {frameId}".into());
            };
            let mut guard = store.lock().expect("session store mutex");
            match guard.set_frame_status(frame as u32, DirectorFrameStatus::Approved) {
                Ok(()) => RouteResult::Ok(serde_json::json!({ "frameId": frame })),
                Err(e) => RouteResult::BadRequest(display_for_session_error(&e)),
            }
        }
        (Method::Post, "/api/commit") => {
            let mut guard = store.lock().expect("session store mutex");
            match guard.commit() {
                Ok(()) => {
                    let _ = tx.send(DirectorEvent::Commit {
                        session_id: guard.session().session_id.clone(),
                    });
                    RouteResult::Ok(serde_json::json!({
                        "sessionId": guard.session().session_id,
                        "status": "committed",
                    }))
                }
                Err(e) => RouteResult::Error(display_for_session_error(&e)),
            }
        }
        (Method::Post, "/api/discard") => {
            let mut guard = store.lock().expect("session store mutex");
            match guard.discard() {
                Ok(()) => {
                    let _ = tx.send(DirectorEvent::Discard {
                        session_id: guard.session().session_id.clone(),
                    });
                    RouteResult::Ok(serde_json::json!({
                        "sessionId": guard.session().session_id,
                        "status": "discarded",
                    }))
                }
                Err(e) => RouteResult::Error(display_for_session_error(&e)),
            }
        }
        _ => RouteResult::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::director::session::DirectorSession;
    use std::io::{Read, Write};

    fn start_server() -> (tempfile::TempDir, DirectorServer) {
        let td = tempfile::tempdir().expect("tmpdir");
        let path = td.path().join("session.json");
        let store =
            SessionStore::create(&path, DirectorSession::new("run1", "idle", 3)).expect("create");
        let server = DirectorServer::start(
            Arc::new(Mutex::new(store)),
            td.path().to_path_buf(),
            0,
        )
        .expect("start");
        (td, server)
    }

    fn request(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(raw.as_bytes()).expect("write");
        let mut out = String::new();
        let _ = stream.read_to_string(&mut out);
        out
    }

    #[test]
    fn test_get_session_and_unknown_route() {
        let (_td, server) = start_server();
        let addr = server.addr();
        let resp = request(addr, "GET /api/session HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.contains("\"success\":true"), "{resp}");
        assert!(resp.contains("\"run_id\":\"run1\""), "{resp}");

        let resp = request(addr, "GET /api/nothing HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 404"), "{resp}");
        server.shutdown();
    }

    #[test]
    fn test_preflight_and_cors_echo() {
        let (_td, server) = start_server();
        let addr = server.addr();
        let resp = request(
            addr,
            "OPTIONS /api/nudge HTTP/1.1\r\nHost: x\r\nOrigin: http://localhost:5173\r\n\r\n",
        );
        assert!(resp.starts_with("HTTP/1.1 204"), "{resp}");
        assert!(
            resp.contains("Access-Control-Allow-Origin: http://localhost:5173"),
            "{resp}"
        );
        let resp = request(
            addr,
            "OPTIONS /api/nudge HTTP/1.1\r\nHost: x\r\nOrigin: http://evil.example\r\n\r\n",
        );
        assert!(resp.starts_with("HTTP/1.1 204"), "{resp}");
        assert!(!resp.contains("Access-Control-Allow-Origin"), "{resp}");
        server.shutdown();
    }

    #[test]
    fn test_nudge_and_commit_flow() {
        let (_td, server) = start_server();
        let addr = server.addr();
        let body = "{\"frameId\": 1, \"dx\": 2, \"dy\": -3}";
        let raw = format!(
            "POST /api/nudge HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let resp = request(addr, &raw);
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.contains("\"dx\":2"), "{resp}");

        let resp = request(
            addr,
            "POST /api/commit HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(resp.contains("committed"), "{resp}");
        let event = server
            .events
            .recv_timeout(Duration::from_secs(2))
            .expect("commit event");
        assert!(matches!(event, DirectorEvent::Commit { .. }));
        server.shutdown();
    }

    #[test]
    fn test_discard_persists_and_emits_event() {
        let (td, server) = start_server();
        let addr = server.addr();
        let resp = request(
            addr,
            "POST /api/discard HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.contains("discarded"), "{resp}");
        let event = server
            .events
            .recv_timeout(Duration::from_secs(2))
            .expect("discard event");
        assert!(matches!(event, DirectorEvent::Discard { .. }));
        server.shutdown();

        let back = SessionStore::load(&td.path().join("session.json")).expect("reload");
        assert_eq!(
            back.session().status,
            crate::director::session::SessionStatus::Discarded
        );
    }

    #[test]
    fn test_bad_nudge_body_is_400() {
        let (_td, server) = start_server();
        let addr = server.addr();
        let body = "{\"frameId\": 99, \"dx\": 1, \"dy\": 1}";
        let raw = format!(
            "POST /api/nudge HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let resp = request(addr, &raw);
        assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");
        assert!(resp.contains("\"success\":false"), "{resp}");
        server.shutdown();
    }
}
