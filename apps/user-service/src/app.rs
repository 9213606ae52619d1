//! # アプリケーションのライフサイクル
//!
//! API サーバー・アクチュエーターサーバー・テレメトリをまとめて起動・停止する。
//!
//! ## 状態遷移
//!
//! ```text
//! (configure) ─▶ Configured ─start─▶ Running ─stop─▶ Stopping ─▶ Stopped
//!                    └───────────────stop──────────────▲
//! ```
//!
//! 設定前の状態は [`App::configure`] が値を返す前の状態に相当するため、
//! 型としては表現しない。

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use userhub_infra::{
    HttpJwksFetcher,
    JwksError,
    JwksKeyStore,
    JwtVerifier,
    repository::{InMemoryUserRepository, UserRepository},
};
use userhub_shared::observability::{Telemetry, TelemetryError};

use crate::{
    app_builder::{ApiDependencies, build_actuator_router, build_api_router},
    config::{AppConfig, ConfigError},
    handler::{ActuatorState, HealthCheck, StoreHealthCheck},
    openapi::{ApiContract, ContractError},
    server::{HttpServer, ServerError, ServerOptions},
};

/// アプリケーションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Configured,
    Running,
    Stopping,
    Stopped,
}

/// 停止処理で発生した個々のエラー
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

/// 停止処理で発生したエラーの集約
///
/// 1 つのコンポーネントの停止に失敗しても、残りのコンポーネントの停止は続行する。
#[derive(Debug)]
pub struct ShutdownErrors(pub Vec<ShutdownError>);

impl fmt::Display for ShutdownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ShutdownErrors {}

/// アプリケーションのエラー
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("JWK Set クライアントを初期化できません: {0}")]
    Jwks(#[from] JwksError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("停止処理に失敗しました: {0}")]
    Shutdown(#[from] ShutdownErrors),
}

/// アプリケーション
pub struct App {
    state:     Mutex<AppState>,
    api:       HttpServer,
    actuator:  HttpServer,
    telemetry: Arc<Telemetry>,
}

impl App {
    /// 設定から依存を初期化し、起動可能な状態のアプリケーションを作る
    ///
    /// ソケットのバインドは [`App::start`] で行う。
    pub fn configure(config: AppConfig, telemetry: Arc<Telemetry>) -> Result<Self, AppError> {
        let repository: Arc<dyn UserRepository> = Arc::new(InMemoryUserRepository::new());
        let contract = Arc::new(ApiContract::embedded(&config.base_url)?);
        tracing::debug!(
            operations = ?contract.operation_ids().collect::<Vec<_>>(),
            "API 契約を読み込みました"
        );

        let verifier = if config.auth.enabled {
            let fetcher = Arc::new(HttpJwksFetcher::new(config.auth.jwk_set_uri.clone())?);
            let keys = JwksKeyStore::new(fetcher);
            Some(Arc::new(JwtVerifier::new(
                keys,
                config.auth.allowed_issuers.clone(),
            )))
        } else {
            tracing::warn!("認証が無効です。API は認証なしで公開されます");
            None
        };

        let api_router = build_api_router(
            &config,
            ApiDependencies {
                repository: repository.clone(),
                contract,
                verifier,
                http_metrics: telemetry.http_metrics(),
            },
        );

        let checks: Vec<Arc<dyn HealthCheck>> = vec![Arc::new(StoreHealthCheck::new(repository))];
        let actuator_router = build_actuator_router(
            &config,
            ActuatorState::new(checks, telemetry.clone()),
        );

        let options = ServerOptions::from(&config.server);
        let api = HttpServer::new("api", config.http.socket_addr()?, api_router, options);
        let actuator = HttpServer::new(
            "actuator",
            config.actuator.socket_addr()?,
            actuator_router,
            options,
        );

        Ok(Self {
            state: Mutex::new(AppState::Configured),
            api,
            actuator,
            telemetry,
        })
    }

    pub fn state(&self) -> AppState {
        self.state
            .lock()
            .map_or(AppState::Stopped, |state| *state)
    }

    fn set_state(&self, next: AppState) {
        if let Ok(mut state) = self.state.lock() {
            let previous = *state;
            tracing::debug!(from = ?previous, to = ?next, "アプリケーションの状態が変化しました");
            *state = next;
        }
    }

    pub fn api_server(&self) -> &HttpServer {
        &self.api
    }

    pub fn actuator_server(&self) -> &HttpServer {
        &self.actuator
    }

    /// 両サーバーを起動する
    ///
    /// どちらかのサーバーが失敗するか、停止が要求されるまで戻らない。
    pub async fn start(&self) -> Result<(), AppError> {
        self.set_state(AppState::Running);
        tracing::info!(service = self.telemetry.service_name(), "アプリケーションを起動します");

        tokio::try_join!(self.actuator.start(), self.api.start())?;
        Ok(())
    }

    /// 両サーバーとテレメトリを並行して停止する
    pub async fn stop(&self) -> Result<(), AppError> {
        self.set_state(AppState::Stopping);

        let (actuator, api, telemetry) = tokio::join!(
            self.actuator.stop(),
            self.api.stop(),
            self.telemetry.shutdown(),
        );

        let errors: Vec<ShutdownError> = [
            actuator.err().map(ShutdownError::from),
            api.err().map(ShutdownError::from),
            telemetry.err().map(ShutdownError::from),
        ]
        .into_iter()
        .flatten()
        .collect();

        self.set_state(AppState::Stopped);

        if errors.is_empty() {
            tracing::info!("アプリケーションを停止しました");
            Ok(())
        } else {
            Err(ShutdownErrors(errors).into())
        }
    }
}

/// SIGINT または SIGTERM を待つ
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("SIGINT ハンドラを登録できません: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("SIGTERM ハンドラを登録できません: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("SIGINT を受信しました"),
        () = terminate => tracing::info!("SIGTERM を受信しました"),
    }
}
