//! # アクセスログミドルウェア
//!
//! リクエスト完了時に、そのリクエストの概要を 1 行のログに集約して出力する
//! tower Layer。
//!
//! ## 出力フィールド
//!
//! | フィールド | 内容 |
//! |-----------|------|
//! | `http.request.method` | メソッド |
//! | `url.path` | パス + クエリ |
//! | `server.address` | `Host` ヘッダー |
//! | `client.address` | 接続元アドレス |
//! | `http.request.header.referer` | `Referer` ヘッダー |
//! | `request_id` | `X-Request-Id` |
//! | `http.response.status_code` | ステータスコード |
//! | `http.request.body.size` | `Content-Length`。無い場合はボディのサイズ（不明な場合は `-`） |
//! | `http.response.body.size` | レスポンスボディのサイズ（不明な場合は `-`） |
//! | `http.latency_ms` | 処理時間 |
//! | `error.message` | エラーレスポンスの詳細（無い場合は `-`） |

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    body::HttpBody,
    extract::ConnectInfo,
    http::{HeaderMap, Request, Response, header},
};
use tower::{Layer, Service};
use userhub_shared::observability::REQUEST_ID_HEADER;

use crate::error::ProblemRecorded;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
}

/// サイズが不明な場合は `-`
fn size_str(size: Option<u64>) -> String {
    size.map_or_else(|| "-".to_string(), |size| size.to_string())
}

/// アクセスログを出力する Layer
///
/// `skip_paths` に一致するパスのリクエストは出力対象外。
#[derive(Clone, Debug, Default)]
pub struct AccessLogLayer {
    skip_paths: &'static [&'static str],
}

impl AccessLogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定したパスをログ出力対象外にする
    pub fn skipping(skip_paths: &'static [&'static str]) -> Self {
        Self { skip_paths }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            skip_paths: self.skip_paths,
        }
    }
}

/// アクセスログを出力する Service
#[derive(Clone, Debug)]
pub struct AccessLogService<S> {
    inner:      S,
    skip_paths: &'static [&'static str],
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AccessLogService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + 'static,
    ReqBody: HttpBody + Send + 'static,
    ResBody: HttpBody + Send + 'static,
{
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // clone-swap パターン: poll_ready で得た readiness を保持する inner を使う
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if self.skip_paths.contains(&req.uri().path()) {
            return Box::pin(async move { inner.call(req).await });
        }

        let method = req.method().as_str().to_owned();
        let path = req
            .uri()
            .path_and_query()
            .map_or_else(|| req.uri().path().to_owned(), |pq| pq.as_str().to_owned());
        let headers = req.headers();
        let host = header_str(headers, header::HOST.as_str()).to_owned();
        let referer = header_str(headers, header::REFERER.as_str()).to_owned();
        let request_id = header_str(headers, REQUEST_ID_HEADER).to_owned();
        let bytes_in = size_str(
            headers
                .get(header::CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .or_else(|| req.body().size_hint().exact()),
        );
        let remote = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map_or_else(|| "-".to_string(), |ConnectInfo(addr)| addr.to_string());

        let start = Instant::now();

        Box::pin(async move {
            let result = inner.call(req).await;
            let latency_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(response) => {
                    let error = response
                        .extensions()
                        .get::<ProblemRecorded>()
                        .map_or("-", |problem| problem.0.as_str());
                    tracing::info!(
                        log.r#type = "access",
                        http.request.method = %method,
                        url.path = %path,
                        server.address = %host,
                        client.address = %remote,
                        http.request.header.referer = %referer,
                        request_id = %request_id,
                        http.response.status_code = response.status().as_u16(),
                        http.request.body.size = %bytes_in,
                        http.response.body.size = %size_str(response.body().size_hint().exact()),
                        http.latency_ms = latency_ms,
                        error.message = error,
                        "リクエスト完了"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        log.r#type = "access",
                        http.request.method = %method,
                        url.path = %path,
                        client.address = %remote,
                        request_id = %request_id,
                        http.latency_ms = latency_ms,
                        error.message = %err,
                        "リクエスト処理エラー"
                    );
                }
            }

            result
        })
    }
}
