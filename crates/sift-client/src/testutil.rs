//! Minimal blocking HTTP stub for transport tests.
//!
//! One accept loop, one thread per connection, `Connection: close` on every
//! response so each request arrives on a fresh socket and the handler sees
//! every call.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::Arc;

/// Canned HTTP/1.1 response with a JSON body.
pub(crate) fn json_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Spawn a stub server; the handler maps (path, bearer token) to a full
/// response. Returns the base URL.
pub(crate) fn spawn_stub_server<F>(handler: F) -> String
where
    F: Fn(&str, Option<&str>) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let handler = handler.clone();
            std::thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    return;
                }
                let path = request_line
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("")
                    .to_string();

                let mut bearer = None;
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).is_err() || line.trim_end().is_empty() {
                        break;
                    }
                    let trimmed = line.trim_end();
                    let lower = trimmed.to_ascii_lowercase();
                    if let Some(rest) = lower.strip_prefix("authorization: bearer ") {
                        bearer = Some(trimmed[trimmed.len() - rest.len()..].to_string());
                    } else if let Some(rest) = lower.strip_prefix("content-length: ") {
                        content_length = rest.trim().parse().unwrap_or(0);
                    }
                }
                let mut body = vec![0u8; content_length];
                let _ = reader.read_exact(&mut body);

                let response = handler(&path, bearer.as_deref());
                let _ = stream.write_all(response.as_bytes());
            });
        }
    });
    format!("http://{}", addr)
}
