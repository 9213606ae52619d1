//! # 契約検証ミドルウェア
//!
//! リクエストを OpenAPI 契約で検証する。
//!
//! - 一致するオペレーションが無い場合は 404
//! - パラメーター・ボディが契約に違反する場合は 400
//!
//! 検証を通ったリクエストには [`OperationId`] を付与し、ラベリングミドルウェアと
//! メトリクスが利用できるようにする。

use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use userhub_shared::observability::OperationId;

use crate::{
    error::ApiError,
    openapi::{ApiContract, Violation},
};

/// 検証のためにバッファリングするリクエストボディの上限
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

impl From<Violation> for ApiError {
    fn from(violation: Violation) -> Self {
        match violation {
            Violation::NotFound(detail) => Self::NotFound(detail),
            Violation::BadRequest(detail) => Self::BadRequest(detail),
        }
    }
}

/// OpenAPI 契約でリクエストを検証するミドルウェア
pub async fn validate_request(
    State(contract): State<Arc<ApiContract>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();

    let (operation_id, body) = {
        let matched = match contract.match_operation(&parts.method, parts.uri.path()) {
            Ok(matched) => matched,
            Err(violation) => return ApiError::from(violation).into_response(),
        };

        if let Err(violation) = matched.validate_parameters(parts.uri.query()) {
            return ApiError::from(violation).into_response();
        }

        let body = if matched.expects_body() {
            let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return ApiError::BadRequest(format!(
                        "リクエストボディを読み取れません: {e}"
                    ))
                    .into_response();
                }
            };
            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok());
            if let Err(violation) = matched.validate_body(content_type, &bytes) {
                return ApiError::from(violation).into_response();
            }
            Body::from(bytes)
        } else {
            body
        };

        (OperationId(matched.operation_id().to_string()), body)
    };

    parts.extensions.insert(operation_id.clone());
    let mut response = next.run(Request::from_parts(parts, body)).await;
    response.extensions_mut().insert(operation_id);
    response
}
