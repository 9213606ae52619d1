//! # 統合テスト共通ヘルパー
//!
//! - テスト用の設定とルーターの構築
//! - フィクスチャの鍵で署名したアクセストークンの発行
//! - フィクスチャの JWK Set を配信するローカルサーバー

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, header},
    response::Response,
    routing,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::Value;
use userhub_infra::{
    HttpJwksFetcher,
    JwksKeyStore,
    JwtVerifier,
    repository::InMemoryUserRepository,
};
use userhub_shared::{
    ProblemDetail,
    observability::{Telemetry, TelemetryConfig, TelemetryOutput},
};
use userhub_user_service::{
    app_builder::{ApiDependencies, build_api_router},
    config::{AppConfig, ConfigLoader, RoleConfig},
    openapi::ApiContract,
};

pub const ISSUER: &str = "https://issuer.example.com";
pub const KID: &str = "test-key-1";

const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/signing_key.pem");
const FOREIGN_KEY: &[u8] = include_bytes!("../fixtures/foreign_key.pem");
const JWKS: &str = include_str!("../fixtures/jwks.json");

/// ポート 0・ループバックで待ち受けるテスト用の設定
pub fn test_config() -> AppConfig {
    let env: HashMap<String, String> = [
        ("HTTP_PORT", "0"),
        ("ACTUATOR_PORT", "0"),
        ("APP__HTTP__HOST", "127.0.0.1"),
        ("APP__ACTUATOR__HOST", "127.0.0.1"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect();
    ConfigLoader::new(env).load().unwrap()
}

/// 認証を有効にした設定
pub fn auth_config(jwk_set_uri: &str) -> AppConfig {
    let mut config = test_config();
    config.auth.enabled = true;
    config.auth.jwk_set_uri = jwk_set_uri.to_string();
    config.auth.allowed_issuers = vec![ISSUER.to_string()];
    config.auth.roles = vec![
        RoleConfig {
            name:     "reader".to_string(),
            audience: "userhub".to_string(),
        },
        RoleConfig {
            name:     "admin".to_string(),
            audience: "userhub-admin".to_string(),
        },
    ];
    config
}

/// メトリクスを有効にしたテレメトリ（subscriber は登録しない）
pub fn test_telemetry() -> Arc<Telemetry> {
    let mut config = TelemetryConfig::new("userhub-test");
    config.metrics.output = TelemetryOutput::Remote;
    Arc::new(Telemetry::new(&config).unwrap())
}

/// API ルーターを構築する
///
/// `config.auth.enabled` が真の場合は `jwk_set_uri` から鍵を取得する検証器を使う。
pub fn api_router(config: &AppConfig, telemetry: &Telemetry) -> Router {
    let verifier = config.auth.enabled.then(|| {
        let fetcher = Arc::new(HttpJwksFetcher::new(config.auth.jwk_set_uri.clone()).unwrap());
        Arc::new(JwtVerifier::new(
            JwksKeyStore::new(fetcher),
            config.auth.allowed_issuers.clone(),
        ))
    });

    build_api_router(
        config,
        ApiDependencies {
            repository: Arc::new(InMemoryUserRepository::new()),
            contract: Arc::new(ApiContract::embedded(&config.base_url).unwrap()),
            verifier,
            http_metrics: telemetry.http_metrics(),
        },
    )
}

/// フィクスチャの JWK Set を配信するサーバーを起動し、その URI を返す
pub async fn spawn_jwks_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().route(
        "/.well-known/jwks.json",
        routing::get(|| async { ([(header::CONTENT_TYPE, "application/json")], JWKS) }),
    );
    tokio::spawn(async move { axum::serve(listener, router).await });
    format!("http://{addr}/.well-known/jwks.json")
}

/// 何も待ち受けていないアドレスの URI
pub fn unreachable_jwks_uri() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/.well-known/jwks.json")
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// 有効なクレーム（発行者・有効期限・対象者・ロール付き）
pub fn valid_claims() -> Value {
    serde_json::json!({
        "iss": ISSUER,
        "sub": "alice",
        "aud": ["userhub"],
        "roles": ["reader", "admin"],
        "iat": now() - 10,
        "exp": now() + 300,
    })
}

fn sign_with(key: &[u8], claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    encode(&header, claims, &EncodingKey::from_rsa_pem(key).unwrap()).unwrap()
}

/// JWK Set に公開鍵がある鍵で署名する
pub fn sign(claims: &Value) -> String {
    sign_with(SIGNING_KEY, claims)
}

/// JWK Set に無い鍵で（同じ kid を名乗って）署名する
pub fn sign_with_foreign_key(claims: &Value) -> String {
    sign_with(FOREIGN_KEY, claims)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn with_bearer(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    request
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub async fn problem(response: Response) -> ProblemDetail {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
