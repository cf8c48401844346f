//! Plain-HTTP to HTTPS redirect middleware.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{HOST, LOCATION};
use http::{Method, Request, Response, StatusCode};
use tower::{Layer, Service};

/// Request extension marking a request that arrived over TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServedOverTls;

/// Paths served over plain HTTP
const EXEMPT_PREFIXES: &[&str] = &[
    "/ping",
    "/health",
    "/healthz",
    "/readyz",
    "/.well-known/acme-challenge/",
];

const FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpsRedirectLayer;

impl HttpsRedirectLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for HttpsRedirectLayer {
    type Service = HttpsRedirect<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpsRedirect { inner }
    }
}

/// Redirects plain-HTTP requests to the HTTPS port.
///
/// GET and HEAD get a `302 Found`; other methods get `400 Bad Request`.
/// Health and ACME challenge paths, TLS requests and requests forwarded as
/// `https` pass through to the inner service.
#[derive(Debug, Clone)]
pub struct HttpsRedirect<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HttpsRedirect<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send,
    S::Future: Send + 'static,
    ResBody: From<Bytes> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if is_exempt(&req) {
            return Box::pin(self.inner.call(req));
        }

        let response = redirect_response(&req);
        Box::pin(async move { Ok(response) })
    }
}

fn is_exempt<B>(req: &Request<B>) -> bool {
    if req.extensions().get::<ServedOverTls>().is_some() {
        return true;
    }
    let forwarded_https = req
        .headers()
        .get(FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("https"));
    if forwarded_https {
        return true;
    }
    let path = req.uri().path();
    EXEMPT_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

fn redirect_response<B, ResBody: From<Bytes>>(req: &Request<B>) -> Response<ResBody> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        let mut response = Response::new(ResBody::from(Bytes::from_static(b"Use HTTPS\n")));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return response;
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", mangle_port(host), path);

    let mut response = Response::new(ResBody::from(Bytes::new()));
    *response.status_mut() = StatusCode::FOUND;
    match location.parse() {
        Ok(value) => {
            response.headers_mut().insert(LOCATION, value);
        }
        Err(_) => *response.status_mut() = StatusCode::BAD_REQUEST,
    }
    response
}

/// Map a `host:port` to the matching HTTPS port: `(port / 1000) * 1000 + 443`.
///
/// Inputs without a numeric port are returned unchanged.
pub fn mangle_port(hostport: &str) -> String {
    let Some((host, port)) = hostport.rsplit_once(':') else {
        return hostport.to_string();
    };
    // Bare IPv6 address without brackets
    if host.contains(':') && !host.ends_with(']') {
        return hostport.to_string();
    }
    match port.parse::<u32>() {
        Ok(port) if port <= u32::from(u16::MAX) => {
            format!("{}:{}", host, (port / 1000) * 1000 + 443)
        }
        _ => hostport.to_string(),
    }
}
