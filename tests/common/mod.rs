//! In-process HTTP stand-in for the remote key services.

#![allow(dead_code)]

use std::{io::Read, sync::Arc, thread};

use parking_lot::Mutex;
use tiny_http::{Header, Response, Server, StatusCode};

#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct FakeServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeServer {
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    pub fn count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.url == url).count()
    }
}

/// Serve every request with `handler` on a background thread until the
/// test process exits.
pub fn serve<F>(handler: F) -> FakeServer
where
    F: Fn(&Recorded) -> (u16, String) + Send + 'static,
{
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = requests.clone();

    thread::spawn(move || {
        for mut rq in server.incoming_requests() {
            let mut body = String::new();
            let _ = rq.as_reader().read_to_string(&mut body);
            let recorded = Recorded {
                method: rq.method().to_string(),
                url: rq.url().to_string(),
                headers: rq
                    .headers()
                    .iter()
                    .map(|h| (h.field.to_string(), h.value.to_string()))
                    .collect(),
                body,
            };
            let (status, reply) = handler(&recorded);
            log.lock().push(recorded);

            let mut resp = Response::from_string(reply).with_status_code(StatusCode(status));
            if let Ok(ct) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
                resp = resp.with_header(ct);
            }
            let _ = rq.respond(resp);
        }
    });

    FakeServer {
        url: format!("http://{addr}"),
        requests,
    }
}

pub fn json_field(body: &str, field: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(body).unwrap();
    value[field].as_str().unwrap_or_default().to_string()
}
