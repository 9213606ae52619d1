//! # Observability 基盤
//!
//! ログ・トレース・メトリクスの初期化と、HTTP リクエストスパンの生成を提供する。
//!
//! ## 出力先
//!
//! | シグナル | `noop` | `stdout` | `remote` |
//! |---------|--------|----------|----------|
//! | トレース | エクスポートしない（ID は採番する） | 標準出力 | OTLP/gRPC |
//! | メトリクス | 収集しない | 60 秒ごとに DEBUG ログへ出力 | `/metrics` で公開 |
//!
//! OTLP の送信先は `OTEL_EXPORTER_OTLP_ENDPOINT` などの標準環境変数で指定する。
//!
//! ## グローバル状態
//!
//! グローバルに登録するのは tracing の subscriber のみ。トレーサープロバイダと
//! メトリクスレジストリは [`Telemetry`] が保持し、利用側に注入する。

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use http::{HeaderMap, HeaderValue, Request, Response};
use opentelemetry::{
    propagation::{Extractor, TextMapPropagator},
    trace::{Status, TraceContextExt, TracerProvider as _},
};
use opentelemetry_sdk::{Resource, propagation::TraceContextPropagator, trace::SdkTracerProvider};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::{
    request_id::{MakeRequestId, RequestId},
    trace::{MakeSpan, OnResponse},
};
use tracing::{Span, field::Empty};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::metrics::{HttpMetrics, render};

/// Request ID のヘッダー名
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// `stdout` 出力時のメトリクス出力間隔
const METRICS_DUMP_INTERVAL: Duration = Duration::from_secs(60);

/// ログ出力形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON 形式（本番環境向け）
    Json,
    /// 人間が読みやすい形式（開発環境向け）
    #[default]
    Pretty,
}

/// トレース・メトリクスの出力先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryOutput {
    #[default]
    Noop,
    Stdout,
    Remote,
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// `EnvFilter` 形式のログレベル。`RUST_LOG` が設定されていればそちらを優先する
    pub level:  String,
    pub format: LogFormat,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            level:  "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// シグナル（トレース / メトリクス）ごとの設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub output: TelemetryOutput,
}

/// テレメトリ初期化設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// サービス名（OpenTelemetry の `service.name` リソース属性）
    pub service_name: String,
    pub logs:         LogsConfig,
    pub traces:       SignalConfig,
    pub metrics:      SignalConfig,
}

impl TelemetryConfig {
    /// 指定したサービス名で、その他は既定値の設定を作成する
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            logs:         LogsConfig::default(),
            traces:       SignalConfig::default(),
            metrics:      SignalConfig::default(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new("userhub")
    }
}

/// テレメトリ初期化・停止時のエラー
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("ログフィルタが不正です: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("トレースエクスポーターの初期化に失敗しました: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("メトリクスの登録に失敗しました: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("トレーシングの初期化に失敗しました: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),

    #[error("トレースプロバイダの停止に失敗しました: {0}")]
    Shutdown(String),
}

/// 初期化済みのテレメトリプロバイダ
///
/// トレーサープロバイダとメトリクスレジストリを保持する。
/// [`Telemetry::shutdown`] でバッファ済みのスパンを送信して停止する。
pub struct Telemetry {
    service_name:    String,
    tracer_provider: SdkTracerProvider,
    registry:        prometheus::Registry,
    http_metrics:    Option<Arc<HttpMetrics>>,
    metrics_dump:    Mutex<Option<JoinHandle<()>>>,
}

impl Telemetry {
    /// プロバイダを構築する
    ///
    /// subscriber は登録しない。テストではこちらを直接使う。
    pub fn new(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let tracer_provider = build_tracer_provider(config)?;

        let registry = prometheus::Registry::new();
        let http_metrics = match config.metrics.output {
            TelemetryOutput::Noop => None,
            TelemetryOutput::Stdout | TelemetryOutput::Remote => {
                Some(Arc::new(HttpMetrics::new(&registry)?))
            }
        };

        let metrics_dump = match config.metrics.output {
            TelemetryOutput::Stdout => spawn_metrics_dump(registry.clone()),
            TelemetryOutput::Noop | TelemetryOutput::Remote => None,
        };

        Ok(Self {
            service_name: config.service_name.clone(),
            tracer_provider,
            registry,
            http_metrics,
            metrics_dump: Mutex::new(metrics_dump),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    /// HTTP メトリクスの記録先（メトリクス出力が `noop` の場合は `None`）
    pub fn http_metrics(&self) -> Option<Arc<HttpMetrics>> {
        self.http_metrics.clone()
    }

    /// Prometheus テキスト形式でメトリクスを出力する
    ///
    /// メトリクス出力が `noop` の場合は空文字列を返す。
    pub fn render_metrics(&self) -> Result<String, prometheus::Error> {
        if self.http_metrics.is_none() {
            return Ok(String::new());
        }
        render(&self.registry)
    }

    /// プロバイダを停止する
    ///
    /// バッチエクスポーターの flush はブロッキング処理のため、専用スレッドで実行する。
    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        if let Some(handle) = self.metrics_dump.lock().ok().and_then(|mut dump| dump.take()) {
            handle.abort();
        }

        let provider = self.tracer_provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .map_err(|e| TelemetryError::Shutdown(e.to_string()))?
            .map_err(|e| TelemetryError::Shutdown(e.to_string()))
    }
}

fn build_tracer_provider(config: &TelemetryConfig) -> Result<SdkTracerProvider, TelemetryError> {
    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();
    let builder = SdkTracerProvider::builder().with_resource(resource);

    let provider = match config.traces.output {
        TelemetryOutput::Noop => builder.build(),
        TelemetryOutput::Stdout => builder
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build(),
        TelemetryOutput::Remote => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .build()?;
            builder.with_batch_exporter(exporter).build()
        }
    };

    Ok(provider)
}

fn spawn_metrics_dump(registry: prometheus::Registry) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("tokio ランタイム外のため、メトリクスの定期出力を行いません");
        return None;
    };

    Some(runtime.spawn(async move {
        let mut interval = tokio::time::interval(METRICS_DUMP_INTERVAL);
        // 初回の tick は即時に完了するため読み捨てる
        interval.tick().await;
        loop {
            interval.tick().await;
            match render(&registry) {
                Ok(text) => tracing::debug!(metrics = %text, "メトリクス"),
                Err(e) => tracing::warn!(error = %e, "メトリクスの出力に失敗しました"),
            }
        }
    }))
}

/// テレメトリを初期化し、グローバル subscriber を登録する
///
/// `RUST_LOG` 環境変数が設定されていればログレベルはそちらを優先する。
///
/// JSON モードでは以下のフィールドがトップレベルに出力される:
/// - `timestamp`, `level`, `target`, `message`
///
/// サービス名は呼び出し元で `tracing::info_span!("app", service = "...")` を設定することで
/// `span.service` として JSON に含まれる。
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    use tracing_subscriber::{EnvFilter, Layer as _, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logs.level)?,
    };

    let fmt_layer = match config.logs.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };

    let telemetry = Telemetry::new(config)?;
    let tracer = telemetry
        .tracer_provider()
        .tracer(config.service_name.clone());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    Ok(telemetry)
}

/// 現在のスパンの OpenTelemetry トレース ID を返す
///
/// 32 桁の小文字 16 進数。有効なトレースコンテキストが無い場合は `None`。
pub fn current_trace_id() -> Option<String> {
    let context = Span::current().context();
    let span = context.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// スパンのステータスをエラーにする
///
/// エクスポートされるスパンの `status` が `Error { description: message }` になる。
pub fn mark_span_error(span: &Span, message: impl Into<String>) {
    span.set_status(Status::error(message.into()));
}

/// マッチした OpenAPI オペレーション ID
///
/// 契約検証ミドルウェアがリクエストとレスポンスの両方に付与する。
/// スパンの `http.route` とメトリクスの `route` ラベルに使用する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationId(pub String);

/// UUID v7 で Request ID を生成する
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::now_v7().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|key| key.as_str()).collect()
    }
}

/// リクエストスパンを生成する `MakeSpan`
///
/// W3C `traceparent` ヘッダーがあれば、そのコンテキストをスパンの親にする。
/// 後続のミドルウェアが記録するフィールドは `Empty` で宣言しておく。
#[derive(Debug, Clone, Default)]
pub struct RequestSpanMaker {
    propagator: TraceContextPropagator,
}

impl RequestSpanMaker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B> MakeSpan<B> for RequestSpanMaker {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let method = request.method().as_str();
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");

        let span = tracing::info_span!(
            "http.request",
            otel.name = method,
            otel.kind = "server",
            http.request.method = method,
            url.path = request.uri().path(),
            request_id = request_id,
            http.route = Empty,
            http.response.status_code = Empty,
            http.response.body.size = Empty,
            enduser.id = Empty,
            enduser.scope = Empty,
            enduser.role = Empty,
        );

        let parent = self
            .propagator
            .extract(&HeaderExtractor(request.headers()));
        if let Err(error) = span.set_parent(parent) {
            tracing::debug!(?error, "親トレースコンテキストを設定できません");
        }

        span
    }
}

/// レスポンスのステータスとサイズをスパンに記録する `OnResponse`
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordResponse;

impl<B: http_body::Body> OnResponse<B> for RecordResponse {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        span.record("http.response.status_code", response.status().as_u16());
        if let Some(size) = response.body().size_hint().exact() {
            span.record("http.response.body.size", size);
        }
        tracing::debug!(
            http.latency_ms = latency.as_millis() as u64,
            "レスポンスを返しました"
        );
    }
}
