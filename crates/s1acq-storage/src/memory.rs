use std::sync::Mutex;

use async_trait::async_trait;

use crate::{FetchError, HttpRequest, HttpResponse, Method, Transport};

#[derive(Debug)]
struct Route {
    method: Method,
    prefix: String,
    responses: Vec<HttpResponse>,
    served: usize,
}

/// In-process `Transport` serving canned responses by method + longest URL prefix.
///
/// A route replays its responses in order and then keeps returning the last one.
/// Unmatched requests get a 404.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: Method, prefix: &str, status: u16, body: impl Into<Vec<u8>>) {
        let response = HttpResponse {
            status,
            final_url: prefix.to_string(),
            body: body.into(),
        };
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.prefix == prefix)
        {
            route.responses.push(response);
            return;
        }
        routes.push(Route {
            method,
            prefix: prefix.to_string(),
            responses: vec![response],
            served: 0,
        });
    }

    pub fn respond_json(&self, method: Method, prefix: &str, body: &serde_json::Value) {
        self.respond(method, prefix, 200, body.to_string());
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn requests_to(&self, method: Method, prefix: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.url.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        let route = routes
            .iter_mut()
            .filter(|r| r.method == request.method && request.url.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len());

        let Some(route) = route else {
            return Ok(HttpResponse {
                status: 404,
                final_url: request.url,
                body: Vec::new(),
            });
        };
        let idx = route.served.min(route.responses.len() - 1);
        route.served += 1;
        let mut response = route.responses[idx].clone();
        response.final_url = request.url;
        Ok(response)
    }
}
