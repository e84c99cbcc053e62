use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use tracing::warn;

use crate::error::{ApiError, BrokerError};

pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";

const TOKEN_BYTES: usize = 32;

/// Token attached to safe requests so handlers can hand it to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken(pub String);

/// Double-submit cookie check: mutating requests must echo the cookie value
/// in the `x-csrf-token` header.
#[derive(Debug, Clone, Default)]
pub struct CsrfGuard {
    secure_cookie: bool,
}

impl CsrfGuard {
    pub fn new(secure_cookie: bool) -> Self {
        Self { secure_cookie }
    }

    pub fn issue_token() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn verify(cookie: Option<&str>, header: Option<&str>) -> Result<(), BrokerError> {
        let (Some(cookie), Some(header)) = (cookie, header) else {
            return Err(BrokerError::Csrf("Missing CSRF token"));
        };
        if cookie.is_empty() || !constant_time_eq(cookie.as_bytes(), header.as_bytes()) {
            return Err(BrokerError::Csrf("Invalid CSRF token"));
        }
        Ok(())
    }

    fn cookie(&self, token: String) -> Cookie<'static> {
        Cookie::build((CSRF_COOKIE, token))
            .path("/")
            .secure(self.secure_cookie)
            .same_site(SameSite::Strict)
            .build()
    }
}

pub async fn csrf_protect(
    State(guard): State<CsrfGuard>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let existing = token_from(&jar);

    if is_safe(request.method()) {
        let (token, jar) = match existing {
            Some(token) => (token, jar),
            None => {
                let token = CsrfGuard::issue_token();
                let jar = jar.add(guard.cookie(token.clone()));
                (token, jar)
            }
        };
        request.extensions_mut().insert(CsrfToken(token.clone()));
        let mut response = next.run(request).await;
        if let Ok(value) = HeaderValue::from_str(&token) {
            response.headers_mut().insert(CSRF_HEADER, value);
        }
        // Only cookies added above are emitted as Set-Cookie.
        return (jar, response).into_response();
    }

    let supplied = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok());
    match CsrfGuard::verify(existing.as_deref(), supplied) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            let reason = match &err {
                BrokerError::Csrf("Missing CSRF token") => "missing",
                _ => "mismatch",
            };
            counter!("beach_broker_csrf_rejected_total", "reason" => reason).increment(1);
            warn!(method = %request.method(), path = %request.uri().path(), reason, "csrf check failed");
            ApiError::from(err).into_response()
        }
    }
}

/// The cookie value with any RFC 6265 surrounding quotes removed.
fn token_from(jar: &CookieJar) -> Option<String> {
    jar.get(CSRF_COOKIE)
        .map(|cookie| cookie.value_trimmed().to_string())
        .filter(|token| !token.is_empty())
}

fn is_safe(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
