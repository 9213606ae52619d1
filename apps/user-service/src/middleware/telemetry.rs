//! # スパンラベリングミドルウェア
//!
//! リクエストスパンにオペレーション ID と認証主体を記録する。
//! スパンのフィールドは `RequestSpanMaker` が `Empty` で宣言済み。

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::Span;
use userhub_shared::observability::OperationId;

use crate::middleware::{AuthClaims, AuthRoles};

/// オペレーション ID と認証主体をスパンに記録するミドルウェア
pub async fn label_operation(request: Request, next: Next) -> Response {
    let span = Span::current();

    if let Some(operation) = request.extensions().get::<OperationId>() {
        span.record("http.route", operation.0.as_str());
        span.record(
            "otel.name",
            format!("{} {}", request.method(), operation.0).as_str(),
        );
    }

    if let Some(AuthClaims(claims)) = request.extensions().get::<AuthClaims>() {
        if let Some(subject) = &claims.subject {
            span.record("enduser.id", subject.as_str());
        }
        span.record("enduser.scope", claims.audiences.join(" ").as_str());
    }

    if let Some(AuthRoles(roles)) = request.extensions().get::<AuthRoles>() {
        span.record("enduser.role", roles.join(",").as_str());
    }

    next.run(request).await
}
