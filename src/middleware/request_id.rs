use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Tags every request/response pair with a stable id for log correlation.
/// An id supplied by the caller is kept; otherwise a fresh v4 uuid is used.
pub async fn inject_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());
        let mut response = next.run(request).await;
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER, header_value);
        response
    } else {
        next.run(request).await
    }
}
