mod client;
mod retry;
mod transport;

pub use client::SourceClient;
#[cfg(test)]
pub use client::fake;
pub use retry::{LastFailure, RetryError, RetryExecutor, RetryPolicy, Sleeper};
pub use transport::{
    HttpRequest, HttpResponse, Method, RedirectHop, ReqwestTransport, Transport, TransportError,
};
