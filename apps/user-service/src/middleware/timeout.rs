//! # 書き込みタイムアウトミドルウェア
//!
//! ハンドラーがタイムアウトまでにレスポンスを返さない場合、処理を打ち切り
//! 408 の Problem Details を返す。
//!
//! tower-http の `TimeoutLayer` は空ボディを返すため、エラーレスポンスの形式を
//! 揃える目的で独自に実装している。

use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;

/// 書き込みタイムアウト
#[derive(Debug, Clone, Copy)]
pub struct WriteTimeout(pub Duration);

/// 書き込みタイムアウトを適用するミドルウェア
pub async fn enforce_write_timeout(
    State(WriteTimeout(limit)): State<WriteTimeout>,
    request: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::RequestTimeout(format!(
            "{} 秒以内に処理が完了しませんでした",
            limit.as_secs()
        ))
        .into_response(),
    }
}
