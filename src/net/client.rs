use super::retry::{RetryError, RetryExecutor};
use super::transport::{HttpRequest, HttpResponse, Transport};

/// Transport plus retry policy, shared by every network-facing component.
pub struct SourceClient {
    transport: Box<dyn Transport>,
    retry: RetryExecutor,
}

impl SourceClient {
    pub fn new(transport: Box<dyn Transport>, retry: RetryExecutor) -> Self {
        Self { transport, retry }
    }

    pub fn send(&self, label: &str, request: &HttpRequest) -> Result<HttpResponse, RetryError> {
        self.retry
            .execute(label, || self.transport.send(request))
    }

    pub fn get(&self, label: &str, url: &str) -> Result<HttpResponse, RetryError> {
        self.send(label, &HttpRequest::get(url))
    }
}

#[cfg(test)]
pub mod fake {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::net::retry::RetryPolicy;
    use crate::net::transport::{Method, TransportError};

    type Route = (Method, String, VecDeque<Result<HttpResponse, TransportError>>);

    /// Scripted transport: each route matches on method plus URL substring and
    /// replays its queued responses, repeating the last one once drained.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: RefCell<Vec<Route>>,
        pub calls: Arc<RefCell<Vec<HttpRequest>>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(self, method: Method, url_fragment: &str, status: u16, body: &[u8]) -> Self {
            self.routes.borrow_mut().push((
                method,
                url_fragment.to_string(),
                VecDeque::from([Ok(ok_response(status, body))]),
            ));
            self
        }

        pub fn route_error(self, method: Method, url_fragment: &str, error: TransportError) -> Self {
            self.routes.borrow_mut().push((
                method,
                url_fragment.to_string(),
                VecDeque::from([Err(error)]),
            ));
            self
        }

        pub fn call_log(&self) -> Arc<RefCell<Vec<HttpRequest>>> {
            Arc::clone(&self.calls)
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.calls.borrow_mut().push(request.clone());
            let mut routes = self.routes.borrow_mut();
            for (method, fragment, queue) in routes.iter_mut() {
                if *method == request.method && request.url.contains(fragment.as_str()) {
                    let next = if queue.len() > 1 {
                        queue.pop_front()
                    } else {
                        queue.front().cloned()
                    };
                    if let Some(next) = next {
                        return next.map(|mut response| {
                            response.final_url = request.url.clone();
                            response
                        });
                    }
                }
            }
            Ok(ok_response(404, b"not found"))
        }
    }

    pub fn ok_response(status: u16, body: &[u8]) -> HttpResponse {
        HttpResponse {
            status,
            final_url: String::new(),
            body: body.to_vec(),
            content_type: None,
            redirects: Vec::new(),
            elapsed: Duration::from_millis(3),
        }
    }

    pub fn client_with(transport: ScriptedTransport) -> SourceClient {
        let retry = RetryExecutor::with_sleeper(
            RetryPolicy {
                max_attempts: 2,
                backoff_base: 1.0,
            },
            Arc::new(|_| {}),
        );
        SourceClient::new(Box::new(transport), retry)
    }
}
