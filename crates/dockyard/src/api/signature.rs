//! Webhook signature verification.
//!
//! Authenticated routes carry `X-Hub-Signature-256: sha256=<hex>`, an
//! HMAC-SHA256 of the raw request body keyed with the shared secret. The
//! layer buffers the body, verifies it in constant time and hands the same
//! bytes on to the handler.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tower::{Layer, Service};
use tracing::debug;

use crate::error::DeployError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

fn keyed_mac(secret: &[u8], body: &[u8]) -> Result<HmacSha256, DeployError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| DeployError::internal(e.to_string()))?;
    mac.update(body);
    Ok(mac)
}

/// Compute the header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, DeployError> {
    let digest = keyed_mac(secret, body)?.finalize().into_bytes();
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(digest)))
}

/// Check `header` against the HMAC of `body`.
pub fn verify(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), DeployError> {
    let header = header.ok_or_else(|| DeployError::auth("missing signature"))?;
    let hex_digest = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| DeployError::auth("unsupported signature scheme"))?;
    let expected =
        hex::decode(hex_digest).map_err(|_| DeployError::auth("malformed signature"))?;

    keyed_mac(secret, body)?
        .verify_slice(&expected)
        .map_err(|_| DeployError::auth("signature mismatch"))
}

/// Tower layer rejecting requests whose body signature does not verify.
#[derive(Clone)]
pub struct SignatureLayer {
    secret: Arc<SecretString>,
    max_body_bytes: usize,
}

impl SignatureLayer {
    /// Create a layer keyed with `secret`, buffering at most `max_body_bytes`.
    pub fn new(secret: SecretString, max_body_bytes: usize) -> Self {
        Self {
            secret: Arc::new(secret),
            max_body_bytes,
        }
    }
}

impl<S> Layer<S> for SignatureLayer {
    type Service = SignatureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SignatureService {
            inner,
            secret: Arc::clone(&self.secret),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// The service wrapper that performs signature verification.
#[derive(Clone)]
pub struct SignatureService<S> {
    inner: S,
    secret: Arc<SecretString>,
    max_body_bytes: usize,
}

impl<S> Service<Request<Body>> for SignatureService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let secret = Arc::clone(&self.secret);
        let limit = self.max_body_bytes;
        // The clone may not be ready; keep the instance `poll_ready` was called on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let bytes = match axum::body::to_bytes(body, limit).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "request body rejected");
                    return Ok(DeployError::InvalidPayload(format!(
                        "request body unreadable or larger than {limit} bytes"
                    ))
                    .into_response());
                }
            };

            let header = parts
                .headers
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok());
            if let Err(e) = verify(secret.expose_secret().as_bytes(), &bytes, header) {
                debug!(path = %parts.uri.path(), error = %e, "webhook signature rejected");
                return Ok(e.into_response());
            }

            inner
                .call(Request::from_parts(parts, Body::from(bytes)))
                .await
        })
    }
}
