//! In-memory `Transport` with canned replies per route. Used by the test
//! suites and by embedders that want to drive the view-models offline.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use super::{HttpMethod, HttpRequest, HttpResponse, Transport, TransportError};

#[derive(Debug, Clone)]
enum Reply {
    Respond(HttpResponse),
    Fail(String),
    BrokenBody(u16, String),
    Held(Arc<Notify>, Box<Reply>),
}

#[derive(Debug)]
struct Route {
    method: HttpMethod,
    path: String,
    replies: VecDeque<Reply>,
    served: Option<Reply>,
}

/// Replies are consumed in order. Once a route's queue is empty the most
/// recently served reply repeats. A route scripted without a query string
/// also answers requests that carry one. Requests with no scripted route
/// get a 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: HttpMethod, path: &str, status: u16, body: Value) {
        self.push(method, path, Reply::Respond(json_response(status, &body)));
    }

    pub fn respond_raw(&self, method: HttpMethod, path: &str, status: u16, body: &str) {
        self.push(
            method,
            path,
            Reply::Respond(HttpResponse {
                status,
                status_text: status_text(status),
                body: body.to_string(),
            }),
        );
    }

    /// Simulates a request that never reaches the server.
    pub fn fail(&self, method: HttpMethod, path: &str, message: &str) {
        self.push(method, path, Reply::Fail(message.to_string()));
    }

    /// The status arrives but reading the body fails.
    pub fn fail_body(&self, method: HttpMethod, path: &str, status: u16, message: &str) {
        self.push(method, path, Reply::BrokenBody(status, message.to_string()));
    }

    /// The reply is held until `gate` is notified.
    pub fn respond_after(
        &self,
        method: HttpMethod,
        path: &str,
        gate: Arc<Notify>,
        status: u16,
        body: Value,
    ) {
        let inner = Reply::Respond(json_response(status, &body));
        self.push(method, path, Reply::Held(gate, Box::new(inner)));
    }

    pub fn fail_after(&self, method: HttpMethod, path: &str, gate: Arc<Notify>, message: &str) {
        let inner = Reply::Fail(message.to_string());
        self.push(method, path, Reply::Held(gate, Box::new(inner)));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self, method: HttpMethod, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.method == method && path_of(&request.url) == path)
            .count()
    }

    fn push(&self, method: HttpMethod, path: &str, reply: Reply) {
        let mut routes = self.routes.lock();
        match routes
            .iter_mut()
            .find(|route| route.method == method && route.path == path)
        {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(Route {
                method,
                path: path.to_string(),
                replies: VecDeque::from([reply]),
                served: None,
            }),
        }
    }

    fn next_reply(&self, method: HttpMethod, path: &str) -> Option<Reply> {
        let mut routes = self.routes.lock();
        let bare = path.split_once('?').map_or(path, |(bare, _)| bare);
        let idx = routes
            .iter()
            .position(|route| route.method == method && route.path == path)
            .or_else(|| {
                routes
                    .iter()
                    .position(|route| route.method == method && route.path == bare)
            })?;
        let route = &mut routes[idx];
        match route.replies.pop_front() {
            Some(reply) => {
                route.served = Some(reply.clone());
                Some(reply)
            }
            None => route.served.clone(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = request.method;
        let path = path_of(&request.url).to_string();
        self.requests.lock().push(request);

        let mut reply = match self.next_reply(method, &path) {
            Some(reply) => reply,
            None => {
                return Ok(json_response(
                    404,
                    &json!({ "message": format!("no scripted route for {method} {path}") }),
                ));
            }
        };

        loop {
            match reply {
                Reply::Respond(response) => return Ok(response),
                Reply::Fail(message) => return Err(TransportError::Unreachable(message)),
                Reply::BrokenBody(status, message) => {
                    return Err(TransportError::Body { status, message });
                }
                Reply::Held(gate, inner) => {
                    gate.notified().await;
                    reply = *inner;
                }
            }
        }
    }
}

/// Path and query of a URL, without scheme and host.
fn path_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    }
}

fn json_response(status: u16, body: &Value) -> HttpResponse {
    HttpResponse {
        status,
        status_text: status_text(status),
        body: if status == 204 { String::new() } else { body.to_string() },
    }
}

fn status_text(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ScriptedTransport, path_of};
    use crate::api::{HttpMethod, HttpRequest, HttpResponse, Transport};

    fn get(url: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    async fn status_of(transport: &ScriptedTransport, url: &str) -> u16 {
        let response: HttpResponse = transport.send(get(url)).await.expect("scripted reply");
        response.status
    }

    #[tokio::test]
    async fn served_replies_give_way_to_newer_ones() {
        let transport = ScriptedTransport::new();
        transport.respond(HttpMethod::Get, "/items", 403, json!({}));
        assert_eq!(status_of(&transport, "http://api.test/items").await, 403);
        assert_eq!(status_of(&transport, "http://api.test/items").await, 403);

        transport.respond(HttpMethod::Get, "/items", 200, json!([]));
        assert_eq!(status_of(&transport, "http://api.test/items").await, 200);
        assert_eq!(status_of(&transport, "http://api.test/items").await, 200);
    }

    #[tokio::test]
    async fn query_string_prefers_exact_route_then_bare_path() {
        let transport = ScriptedTransport::new();
        transport.respond(HttpMethod::Get, "/items", 200, json!([]));
        transport.respond(HttpMethod::Get, "/items?done=true", 202, json!([]));

        assert_eq!(status_of(&transport, "http://api.test/items?done=true").await, 202);
        assert_eq!(status_of(&transport, "http://api.test/items?done=false").await, 200);
        assert_eq!(status_of(&transport, "http://api.test/other").await, 404);
    }

    #[test]
    fn path_of_strips_scheme_and_host() {
        assert_eq!(path_of("http://localhost:7860/api/v1/auth/me"), "/api/v1/auth/me");
        assert_eq!(path_of("https://host/items?x=1"), "/items?x=1");
        assert_eq!(path_of("https://host"), "/");
    }
}
