//! # アクチュエーターハンドラ
//!
//! 運用向けエンドポイントを提供する。API サーバーとは別のポートで待ち受ける。
//!
//! ## エンドポイント
//!
//! ```text
//! GET /health   # 200 SERVING / 503 Problem Details
//! GET /metrics  # Prometheus テキスト形式
//! ```
//!
//! ## レスポンス例
//!
//! ```json
//! {
//!   "status": "SERVING",
//!   "checks": { "store": "ok" }
//! }
//! ```

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use futures_util::future::join_all;
use userhub_infra::repository::UserRepository;
use userhub_shared::{
    CheckStatus, HealthResponse, ServingStatus, observability::Telemetry,
};

use crate::error::ApiError;

/// 個別チェックのタイムアウト
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Prometheus テキスト形式のメディアタイプ
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// 依存先の稼働確認
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// レスポンスの `checks` に使う名前
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), String>;
}

/// ユーザーストアの稼働確認
pub struct StoreHealthCheck {
    repository: Arc<dyn UserRepository>,
}

impl StoreHealthCheck {
    pub fn new(repository: Arc<dyn UserRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl HealthCheck for StoreHealthCheck {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> Result<(), String> {
        let users = self.repository.count().await;
        tracing::trace!(users, "ユーザーストアに到達できました");
        Ok(())
    }
}

/// アクチュエーターの共有状態
#[derive(Clone)]
pub struct ActuatorState {
    checks:      Arc<Vec<Arc<dyn HealthCheck>>>,
    telemetry:   Arc<Telemetry>,
    last_status: Arc<Mutex<Option<ServingStatus>>>,
}

impl ActuatorState {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            checks: Arc::new(checks),
            telemetry,
            last_status: Arc::new(Mutex::new(None)),
        }
    }

    /// 全チェックを並行して実行する
    async fn run_checks(&self) -> HealthResponse {
        let results = join_all(self.checks.iter().map(|check| async move {
            let status = match tokio::time::timeout(CHECK_TIMEOUT, check.check()).await {
                Ok(Ok(())) => CheckStatus::Ok,
                Ok(Err(reason)) => {
                    tracing::warn!(check = check.name(), reason = %reason, "ヘルスチェックに失敗しました");
                    CheckStatus::Error
                }
                Err(_) => {
                    tracing::warn!(check = check.name(), "ヘルスチェックがタイムアウトしました");
                    CheckStatus::Error
                }
            };
            (check.name().to_string(), status)
        }))
        .await;

        HealthResponse::from_checks(results.into_iter().collect::<BTreeMap<_, _>>())
    }

    /// 前回から全体のステータスが変化していればログに出力する
    fn record_status(&self, status: ServingStatus) {
        let Ok(mut last) = self.last_status.lock() else {
            return;
        };
        let previous = *last;
        if previous != Some(status) {
            match status {
                ServingStatus::Serving => {
                    tracing::info!(
                        previous = ?previous,
                        current = ?status,
                        "ヘルスステータスが変化しました"
                    );
                }
                ServingStatus::NotServing => {
                    tracing::warn!(
                        previous = ?previous,
                        current = ?status,
                        "ヘルスステータスが変化しました"
                    );
                }
            }
            *last = Some(status);
        }
    }
}

/// ヘルスチェックエンドポイント
///
/// 稼働中でない場合は、失敗したチェック名を detail に含む 503 の
/// Problem Details を返す。
pub async fn health(State(state): State<ActuatorState>) -> Result<Json<HealthResponse>, ApiError> {
    let response = state.run_checks().await;
    state.record_status(response.status);

    if response.is_serving() {
        return Ok(Json(response));
    }
    let failed: Vec<&str> = response
        .checks
        .iter()
        .filter(|(_, status)| **status == CheckStatus::Error)
        .map(|(name, _)| name.as_str())
        .collect();
    Err(ApiError::ServiceUnavailable(format!(
        "ヘルスチェックに失敗しました: {}",
        failed.join(", ")
    )))
}

/// メトリクスエンドポイント
pub async fn metrics(State(state): State<ActuatorState>) -> Result<Response, ApiError> {
    let text = state
        .telemetry
        .render_metrics()
        .map_err(|e| ApiError::Internal(format!("メトリクスを出力できません: {e}")))?;

    Ok(([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], text).into_response())
}

/// 未定義パスのフォールバック
pub async fn not_found() -> ApiError {
    ApiError::NotFound("リソースが見つかりません".to_string())
}
