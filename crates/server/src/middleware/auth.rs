use axum::{
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use geoscope_core::DispatchError;
use geoscope_mcp::protocol::JsonRpcResponse;
use geoscope_mcp::UserContext;
use sha2::{Digest, Sha256};

/// Derive the caller identity from the `Authorization` header.
///
/// Tokens are not verified here; the identity is passed through to
/// handlers as-is. A JWT-shaped token contributes its `sub` claim and the
/// rest of its payload, any other token a fingerprint of itself.
pub fn extract_user_from_headers(headers: &HeaderMap) -> Result<Option<UserContext>, DispatchError> {
    let Some(auth_header) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let auth_str = auth_header
        .to_str()
        .map_err(|_| DispatchError::Authorization("Authorization header is not valid ASCII".to_string()))?;

    let token = auth_str
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| DispatchError::Authorization("Expected a Bearer token".to_string()))?;
    if token.is_empty() {
        return Err(DispatchError::Authorization("Bearer token is empty".to_string()));
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() == 3 {
        return user_from_jwt_payload(parts[1]).map(Some);
    }

    Ok(Some(UserContext::new(format!("token:{}", fingerprint(token)))))
}

fn user_from_jwt_payload(payload: &str) -> Result<UserContext, DispatchError> {
    let malformed = || DispatchError::Authorization("Malformed token payload".to_string());

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| malformed())?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).map_err(|_| malformed())?;
    let subject = claims
        .get("sub")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DispatchError::Authorization("Token has no subject".to_string()))?
        .to_string();

    Ok(UserContext { subject, claims })
}

fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

/// Attach the caller identity to the request, rejecting malformed
/// credentials with an `AuthorizationError` envelope
pub async fn attach_user(mut req: Request, next: Next) -> Response {
    match extract_user_from_headers(req.headers()) {
        Ok(user) => {
            if let Some(user) = user {
                tracing::debug!(subject = %user.subject, "Request carries user context");
                req.extensions_mut().insert(user);
            }
            next.run(req).await
        }
        Err(e) => {
            tracing::warn!("Rejected credentials: {}", e);
            (
                StatusCode::UNAUTHORIZED,
                Json(JsonRpcResponse::error(None, e.into())),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use geoscope_core::ErrorKind;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_no_header_is_anonymous() {
        assert_eq!(extract_user_from_headers(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn test_opaque_token_fingerprint() {
        let user = extract_user_from_headers(&headers("Bearer token123")).unwrap().unwrap();
        assert!(user.subject.starts_with("token:"));
        assert_eq!(user.subject.len(), "token:".len() + 16);

        // Same token, same identity
        let again = extract_user_from_headers(&headers("Bearer token123")).unwrap().unwrap();
        assert_eq!(user, again);
    }

    #[test]
    fn test_jwt_subject() {
        // {"sub":"analyst-7","team":"seo"}
        let user = extract_user_from_headers(&headers(
            "Bearer eyJhbGciOiJub25lIn0.eyJzdWIiOiJhbmFseXN0LTciLCJ0ZWFtIjoic2VvIn0.sig",
        ))
        .unwrap()
        .unwrap();

        assert_eq!(user.subject, "analyst-7");
        assert_eq!(user.claims["team"], "seo");
    }

    #[test]
    fn test_malformed_credentials() {
        for value in ["Basic dXNlcjpwdw==", "Bearer ", "Bearer a.!!!.c"] {
            let err = extract_user_from_headers(&headers(value)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AuthorizationError, "{}", value);
        }
    }
}
