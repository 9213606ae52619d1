//! # ユーザーサービスのエラー定義
//!
//! API エラーと、RFC 7807 Problem Details レスポンスへの変換を定義する。
//!
//! 非 2xx レスポンスはすべて [`problem_response`] を経由して生成する。
//! これにより以下が一箇所に集約される:
//!
//! - `instance` には元のリクエスト URI（パス + クエリ）を入れる
//! - `traceId` には現在のスパンのトレース ID を入れる
//! - リクエストスパンをエラーとしてマークし、エラーイベントを記録する
//! - 500 のときクライアントには固定メッセージのみを返す

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use userhub_domain::DomainError;
use userhub_shared::{
    PROBLEM_JSON_CONTENT_TYPE,
    ProblemDetail,
    observability::{current_trace_id, mark_span_error},
};

use crate::middleware::current_request_uri;

/// レスポンスに記録したエラー詳細
///
/// アクセスログがエラー内容を出力するため、レスポンス extensions に付与する。
/// 500 の場合もクライアントに返さなかった内部の詳細を保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemRecorded(pub String);

/// API で発生するエラー
#[derive(Debug, Error)]
pub enum ApiError {
    /// 入力不正・契約違反・認証ヘッダー不正
    #[error("{0}")]
    BadRequest(String),

    /// トークン検証失敗
    #[error("{0}")]
    Unauthorized(String),

    /// リソースまたはオペレーションが存在しない
    #[error("{0}")]
    NotFound(String),

    /// 書き込みタイムアウト
    #[error("{0}")]
    RequestTimeout(String),

    /// 内部エラー
    #[error("{0}")]
    Internal(String),

    /// ヘルスチェック失敗
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RequestTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::BadRequest(msg),
            err @ DomainError::NotFound { .. } => Self::NotFound(err.to_string()),
            DomainError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        problem_response(self.status(), self.to_string())
    }
}

/// Problem Details レスポンスを生成する
///
/// `instance` は task-local に保存されたリクエスト URI から取得する。
pub fn problem_response(status: StatusCode, detail: impl Into<String>) -> Response {
    let instance = current_request_uri().unwrap_or_default();
    problem_response_with_instance(status, detail, instance)
}

/// `instance` を明示して Problem Details レスポンスを生成する
///
/// task-local が設定されるより外側のミドルウェア（パニック回復等）が使用する。
pub fn problem_response_with_instance(
    status: StatusCode,
    detail: impl Into<String>,
    instance: impl Into<String>,
) -> Response {
    let detail = detail.into();
    let title = status.canonical_reason().unwrap_or_default();

    mark_span_error(&tracing::Span::current(), title);

    let problem = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(
            error.category = "internal",
            exception.message = %detail,
            "内部エラー: {}",
            detail
        );
        ProblemDetail::internal_error()
    } else {
        if status.is_server_error() {
            tracing::error!(exception.message = %detail, "{}: {}", title, detail);
        } else {
            tracing::warn!(exception.message = %detail, "{}: {}", title, detail);
        }
        ProblemDetail::new(status, detail.clone())
    };

    let problem = problem
        .with_instance(instance)
        .with_trace_id(current_trace_id().unwrap_or_default());

    let mut response = (
        status,
        [(header::CONTENT_TYPE, PROBLEM_JSON_CONTENT_TYPE)],
        Json(problem),
    )
        .into_response();
    response.extensions_mut().insert(ProblemRecorded(detail));
    response
}
