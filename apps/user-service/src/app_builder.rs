//! # ルーター構築
//!
//! API サーバーとアクチュエーターサーバーのルーターを組み立てる。
//! 依存の初期化は [`crate::app::App`] が行い、ここでは受け取った依存を
//! State とミドルウェアに配線するだけにする。

use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::RequestBodyTimeoutLayer,
    trace::TraceLayer,
};
use userhub_infra::{JwtVerifier, repository::UserRepository};
use userhub_shared::{
    metrics::{HttpMetrics, HttpMetricsLayer},
    observability::{MakeRequestUuidV7, RecordResponse, RequestSpanMaker},
};

use crate::{
    config::AppConfig,
    handler::{ActuatorState, UserState, create_user, get_user, health, list_users, metrics, not_found},
    middleware::{
        AccessLogLayer,
        AuthState,
        RoleDefinitions,
        WriteTimeout,
        attach_roles,
        authenticate,
        capture_request_uri,
        enforce_write_timeout,
        label_operation,
        recover_panic,
        validate_request,
    },
    openapi::ApiContract,
};

/// アクチュエーターでアクセスログを出力しないパス
const ACTUATOR_QUIET_PATHS: &[&str] = &["/health", "/metrics"];

/// API ルーターの依存
pub struct ApiDependencies {
    pub repository:   Arc<dyn UserRepository>,
    pub contract:     Arc<ApiContract>,
    /// 認証が無効な場合は `None`
    pub verifier:     Option<Arc<JwtVerifier>>,
    /// メトリクスが無効な場合は `None`
    pub http_metrics: Option<Arc<HttpMetrics>>,
}

/// API サーバーのルーターを構築する
pub fn build_api_router(config: &AppConfig, deps: ApiDependencies) -> Router {
    let user_state = UserState {
        repository: deps.repository,
    };

    let routes = Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/{userid}", get(get_user))
        .with_state(user_state);

    let routes = if config.base_url.is_empty() {
        routes
    } else {
        Router::new().nest(&config.base_url, routes)
    };

    // レイヤー順序が重要: 下に書いたものが外側
    let mut app = routes.fallback(not_found).layer(from_fn(label_operation));

    if let Some(verifier) = deps.verifier {
        let roles = RoleDefinitions::new(&config.auth.roles);
        app = app
            .layer(from_fn_with_state(roles, attach_roles))
            .layer(from_fn_with_state(AuthState { verifier }, authenticate));
    }

    app.layer(from_fn_with_state(deps.contract, validate_request))
        .layer(from_fn_with_state(
            WriteTimeout(config.server.write_timeout()),
            enforce_write_timeout,
        ))
        .layer(RequestBodyTimeoutLayer::new(config.server.read_timeout()))
        .layer(from_fn(capture_request_uri))
        .layer(HttpMetricsLayer::new(deps.http_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(RequestSpanMaker::new())
                .on_response(RecordResponse),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(AccessLogLayer::new())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(from_fn(recover_panic))
}

/// アクチュエーターサーバーのルーターを構築する
pub fn build_actuator_router(config: &AppConfig, state: ActuatorState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .with_state(state)
        .layer(from_fn_with_state(
            WriteTimeout(config.server.write_timeout()),
            enforce_write_timeout,
        ))
        .layer(RequestBodyTimeoutLayer::new(config.server.read_timeout()))
        .layer(from_fn(capture_request_uri))
        .layer(AccessLogLayer::skipping(ACTUATOR_QUIET_PATHS))
        .layer(from_fn(recover_panic))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;
    use userhub_shared::{
        ProblemDetail,
        observability::{Telemetry, TelemetryConfig},
    };

    use super::*;
    use crate::{config::ConfigLoader, handler::HealthCheck};

    /// 書き込みタイムアウトより長く、個別チェックのタイムアウトより短く待つチェック
    struct SlowCheck;

    #[async_trait]
    impl HealthCheck for SlowCheck {
        fn name(&self) -> &str {
            "slow"
        }

        async fn check(&self) -> Result<(), String> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        }
    }

    fn actuator(write_timeout_secs: u64, checks: Vec<Arc<dyn HealthCheck>>) -> Router {
        let mut config = ConfigLoader::new(HashMap::new()).load().unwrap();
        config.server.write_timeout_secs = write_timeout_secs;
        let telemetry = Arc::new(Telemetry::new(&TelemetryConfig::default()).unwrap());
        build_actuator_router(&config, ActuatorState::new(checks, telemetry))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn problem(response: axum::response::Response) -> ProblemDetail {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    // ===== アクチュエーター テスト =====

    #[tokio::test(start_paused = true)]
    async fn test_アクチュエーターにも書き込みタイムアウトが適用される() {
        let response = actuator(1, vec![Arc::new(SlowCheck)])
            .oneshot(get_request("/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let problem = problem(response).await;
        assert_eq!(problem.status, 408);
        assert_eq!(problem.instance, "/health");
    }

    #[tokio::test(start_paused = true)]
    async fn test_書き込みタイムアウト内に終わるヘルスチェックは200() {
        let response = actuator(10, vec![Arc::new(SlowCheck)])
            .oneshot(get_request("/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_アクチュエーターの未定義パスは404のproblem_detail() {
        let response = actuator(10, vec![])
            .oneshot(get_request("/unknown?x=1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(problem(response).await.instance, "/unknown?x=1");
    }
}
