//! Minimal HTTP/1.1 stub server for registry-facing tests.
//! Canned responses per path, consumed in order; tracks request order and the
//! peak number of simultaneous connections.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Clone, Debug)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

struct StubState {
    // path -> queued responses; the last one repeats once the queue drains
    routes: Mutex<HashMap<String, Vec<StubResponse>>>,
    requests: Mutex<Vec<(String, String)>>,
    current_connections: AtomicUsize,
    peak_connections: AtomicUsize,
    shutdown: AtomicBool,
}

/// One stub server bound to an ephemeral localhost port.
pub struct StubServer {
    addr: String,
    state: Arc<StubState>,
}

impl StubServer {
    pub fn start(routes: Vec<(&str, Vec<StubResponse>)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(StubState {
            routes: Mutex::new(
                routes
                    .into_iter()
                    .map(|(path, responses)| (path.to_string(), responses))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
            current_connections: AtomicUsize::new(0),
            peak_connections: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_state.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let conn_state = Arc::clone(&accept_state);
                thread::spawn(move || handle_connection(stream, conn_state));
            }
        });

        Self { addr, state }
    }

    /// Base URL, e.g. `http://127.0.0.1:43117`.
    pub fn base_url(&self) -> &str {
        &self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// (method, path) pairs in arrival order.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn peak_connections(&self) -> usize {
        self.state.peak_connections.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.state.shutdown.store(true, Ordering::Relaxed);
        // Unblock the accept loop.
        if let Some(addr) = self.addr.strip_prefix("http://") {
            let _ = TcpStream::connect(addr);
        }
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(mut stream: TcpStream, state: Arc<StubState>) {
    let current = state.current_connections.fetch_add(1, Ordering::SeqCst) + 1;
    // CAS loop keeps the peak monotonic under concurrent bumps.
    let mut peak = state.peak_connections.load(Ordering::SeqCst);
    while current > peak {
        match state.peak_connections.compare_exchange(
            peak,
            current,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(observed) => peak = observed,
        }
    }

    let result = serve_one(&mut stream, &state);
    state.current_connections.fetch_sub(1, Ordering::SeqCst);
    let _ = result;
}

fn serve_one(stream: &mut TcpStream, state: &StubState) -> std::io::Result<()> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    // Read the head byte-by-byte; requests in these tests carry no body.
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            return Ok(());
        }
        raw.push(byte[0]);
        if raw.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let head = String::from_utf8_lossy(&raw).to_string();
    let mut first_line = head.lines().next().unwrap_or("").split_whitespace();
    let method = first_line.next().unwrap_or("").to_string();
    let target = first_line.next().unwrap_or("").to_string();
    state.requests.lock().unwrap().push((method.clone(), target.clone()));

    // Drain any request body so closing the socket cannot RST the response.
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        let mut filled = 0;
        while filled < content_length {
            let n = stream.read(&mut body[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
    }

    let response = {
        let mut routes = state.routes.lock().unwrap();
        match routes.get_mut(&target) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => StubResponse::new(404),
        }
    };

    let mut payload = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason(response.status)
    );
    for (name, value) in &response.headers {
        payload.push_str(&format!("{}: {}\r\n", name, value));
    }
    // HEAD responses must not carry a body even when Content-Length is set.
    let body: &[u8] = if method == "HEAD" { &[] } else { &response.body };
    payload.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    payload.push_str("Connection: close\r\n\r\n");

    stream.write_all(payload.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_serves_queued_responses() {
        let server = StubServer::start(vec![(
            "/v2/",
            vec![
                StubResponse::new(500),
                StubResponse::new(200).with_body(b"ok"),
            ],
        )]);

        let client = reqwest::blocking::Client::new();
        let first = client.get(server.url("/v2/")).send().unwrap();
        assert_eq!(first.status().as_u16(), 500);
        let second = client.get(server.url("/v2/")).send().unwrap();
        assert_eq!(second.status().as_u16(), 200);
        assert_eq!(second.bytes().unwrap().as_ref(), b"ok");
        // Last response repeats.
        let third = client.get(server.url("/v2/")).send().unwrap();
        assert_eq!(third.status().as_u16(), 200);

        assert_eq!(server.requests().len(), 3);
    }

    #[test]
    fn test_unrouted_paths_get_404() {
        let server = StubServer::start(vec![]);
        let client = reqwest::blocking::Client::new();
        let resp = client.get(server.url("/missing")).send().unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }
}
