//! # リクエスト URI 保持ミドルウェア
//!
//! エラーレスポンスの `instance` に元のリクエスト URI を入れるため、
//! リクエスト URI（パス + クエリ）を task-local に保存する。
//!
//! `Router::nest` の内側ではパスからベースパスが除かれるため、
//! ネスト前の外側レイヤーで保存しておく。

use axum::{
    extract::Request,
    http::Uri,
    middleware::Next,
    response::Response,
};

tokio::task_local! {
    static REQUEST_URI: String;
}

/// 現在のリクエストの URI を取得する
///
/// task-local スコープ外（テスト等）では `None` を返す。
pub fn current_request_uri() -> Option<String> {
    REQUEST_URI.try_with(|uri| uri.clone()).ok()
}

/// `instance` に使う形式（パス + クエリ）に変換する
pub fn request_instance(uri: &Uri) -> String {
    uri.path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string())
}

/// リクエスト URI を task-local に保存するミドルウェア
pub async fn capture_request_uri(request: Request, next: Next) -> Response {
    let uri = request_instance(request.uri());
    REQUEST_URI.scope(uri, next.run(request)).await
}
