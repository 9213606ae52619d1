//! # パニック回復ミドルウェア
//!
//! 後続の処理でパニックが発生した場合に、接続を切らずに 500 の
//! Problem Details を返す。最も外側に配置する。

use std::{any::Any, panic::AssertUnwindSafe};

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use futures_util::FutureExt;

use crate::{error::problem_response_with_instance, middleware::request_uri::request_instance};

/// パニックを 500 レスポンスに変換するミドルウェア
pub async fn recover_panic(request: Request, next: Next) -> Response {
    let instance = request_instance(request.uri());

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(
                error.category = "panic",
                panic.message = %message,
                "リクエスト処理中にパニックが発生しました"
            );
            problem_response_with_instance(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("パニックが発生しました: {message}"),
                instance,
            )
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "(不明なパニック)".to_string()
    }
}
