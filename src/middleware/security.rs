use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::state::AppState;

/// Rejects requests whose Host header is not on the configured allow-list.
/// A `*` entry disables the check.
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let trusted = &state.config.trusted_hosts;
    if trusted.iter().any(|host| host.trim() == "*") {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();

    if host.is_empty() || !trusted.iter().any(|value| value.eq_ignore_ascii_case(host)) {
        return AppError::Forbidden("Host not allowed.".to_string()).into_response();
    }

    next.run(request).await
}

fn strip_port(host: &str) -> &str {
    host.trim().rsplit_once(':').map_or(host.trim(), |(name, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            host.trim()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::strip_port;

    #[test]
    fn strips_numeric_ports_only() {
        assert_eq!(strip_port("localhost:8080"), "localhost");
        assert_eq!(strip_port("localhost"), "localhost");
        assert_eq!(strip_port(" api.example.com:443 "), "api.example.com");
    }
}
