//! # HTTP メトリクス
//!
//! リクエスト数と処理時間を Prometheus 形式で記録する tower Layer。
//!
//! ## メトリクス仕様
//!
//! | 名前 | 種類 | ラベル |
//! |------|------|--------|
//! | `http_server_requests_total` | Counter | `method`, `route`, `status` |
//! | `http_server_request_duration_seconds` | Histogram | `method`, `route`, `status` |
//!
//! `route` はマッチした OpenAPI オペレーション ID。マッチしなかったリクエストは
//! `unmatched` に集約し、ラベルのカーディナリティを抑える。

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use http::{Request, Response};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tower::{Layer, Service};

use crate::observability::OperationId;

/// オペレーションにマッチしなかったリクエストの `route` ラベル
const UNMATCHED_ROUTE: &str = "unmatched";

/// HTTP リクエストのメトリクス記録先
#[derive(Debug, Clone)]
pub struct HttpMetrics {
    requests_total:   IntCounterVec,
    request_duration: HistogramVec,
}

impl HttpMetrics {
    /// メトリクスを作成し、レジストリに登録する
    ///
    /// # Errors
    ///
    /// 同名のメトリクスが既にレジストリに登録されている場合はエラーを返す。
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let labels = &["method", "route", "status"];

        let requests_total = IntCounterVec::new(
            Opts::new("http_server_requests_total", "Total HTTP requests handled"),
            labels,
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_server_request_duration_seconds",
                "HTTP request handling duration in seconds",
            ),
            labels,
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            requests_total,
            request_duration,
        })
    }

    /// 1 リクエスト分を記録する
    pub fn observe(&self, method: &str, route: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        let labels = [method, route, status.as_str()];
        self.requests_total.with_label_values(&labels).inc();
        self.request_duration
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }
}

/// レジストリの内容を Prometheus テキスト形式で出力する
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// HTTP メトリクスを記録する Layer
///
/// 記録先が `None` の場合は何もしない。
#[derive(Clone, Debug)]
pub struct HttpMetricsLayer {
    metrics: Option<Arc<HttpMetrics>>,
}

impl HttpMetricsLayer {
    pub fn new(metrics: Option<Arc<HttpMetrics>>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

/// HTTP メトリクスを記録する Service
#[derive(Clone, Debug)]
pub struct HttpMetricsService<S> {
    inner:   S,
    metrics: Option<Arc<HttpMetrics>>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HttpMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
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

        let Some(metrics) = self.metrics.clone() else {
            return Box::pin(async move { inner.call(req).await });
        };

        let method = req.method().as_str().to_owned();
        let start = Instant::now();

        Box::pin(async move {
            let result = inner.call(req).await;

            if let Ok(response) = &result {
                let route = response
                    .extensions()
                    .get::<OperationId>()
                    .map_or(UNMATCHED_ROUTE, |op| op.0.as_str());
                metrics.observe(
                    &method,
                    route,
                    response.status().as_u16(),
                    start.elapsed(),
                );
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use pretty_assertions::assert_eq;

    use super::*;

    // テスト用のダミー Service（オペレーション ID を付与するかを切り替える）
    #[derive(Clone)]
    struct DummyService {
        operation: Option<&'static str>,
    }

    impl Service<Request<()>> for DummyService {
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
        type Response = Response<()>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<()>) -> Self::Future {
            let operation = self.operation;
            Box::pin(async move {
                let mut response = Response::builder().status(201).body(()).unwrap();
                if let Some(op) = operation {
                    response
                        .extensions_mut()
                        .insert(OperationId(op.to_string()));
                }
                Ok(response)
            })
        }
    }

    fn setup() -> (Registry, Arc<HttpMetrics>) {
        let registry = Registry::new();
        let metrics = Arc::new(HttpMetrics::new(&registry).unwrap());
        (registry, metrics)
    }

    fn count(metrics: &HttpMetrics, method: &str, route: &str, status: &str) -> u64 {
        metrics
            .requests_total
            .with_label_values(&[method, route, status])
            .get()
    }

    #[tokio::test]
    async fn test_オペレーションidをrouteラベルとして記録する() {
        let (_registry, metrics) = setup();
        let mut sut = HttpMetricsLayer::new(Some(metrics.clone())).layer(DummyService {
            operation: Some("createUser"),
        });

        let request = Request::builder().method("POST").body(()).unwrap();
        sut.call(request).await.unwrap();

        assert_eq!(count(&metrics, "POST", "createUser", "201"), 1);
    }

    #[tokio::test]
    async fn test_オペレーションidが無い場合はunmatchedに集約する() {
        let (_registry, metrics) = setup();
        let mut sut =
            HttpMetricsLayer::new(Some(metrics.clone())).layer(DummyService { operation: None });

        sut.call(Request::builder().body(()).unwrap()).await.unwrap();

        assert_eq!(count(&metrics, "GET", "unmatched", "201"), 1);
    }

    #[tokio::test]
    async fn test_記録先が無い場合はそのまま通過する() {
        let mut sut = HttpMetricsLayer::new(None).layer(DummyService { operation: None });

        let response = sut.call(Request::builder().body(()).unwrap()).await.unwrap();

        assert_eq!(response.status(), 201);
    }

    #[test]
    fn test_同じレジストリへの二重登録はエラー() {
        let (registry, _metrics) = setup();

        assert!(HttpMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_renderがテキスト形式で出力する() {
        let (registry, metrics) = setup();
        metrics.observe("GET", "getUser", 404, Duration::from_millis(1));

        let text = render(&registry).unwrap();

        assert!(text.contains(
            "http_server_requests_total{method=\"GET\",route=\"getUser\",status=\"404\"} 1"
        ));
        assert!(text.contains("http_server_request_duration_seconds_bucket"));
    }
}
