//! # 認証の統合テスト
//!
//! ローカルに起動した JWK Set サーバーの鍵でアクセストークンを検証する。
//!
//! - ヘッダー欠落・形式不正は 400
//! - 署名・発行者・有効期限の不正は 401
//! - JWK Set を取得できない場合は 500

mod common;

use axum::http::StatusCode;
use common::{
    api_router,
    auth_config,
    get,
    now,
    post_json,
    problem,
    sign,
    sign_with_foreign_key,
    spawn_jwks_server,
    test_telemetry,
    unreachable_jwks_uri,
    valid_claims,
    with_bearer,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tower::ServiceExt;

async fn app() -> axum::Router {
    let jwks_uri = spawn_jwks_server().await;
    api_router(&auth_config(&jwks_uri), &test_telemetry())
}

#[tokio::test]
async fn test_有効なトークンでapiを利用できる() {
    let app = app().await;
    let token = sign(&valid_claims());

    let response = app
        .clone()
        .oneshot(with_bearer(
            post_json("/api/users", &json!({ "name": "Alice" })),
            &token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(with_bearer(get("/api/users/1"), &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_authorizationヘッダーが無い場合は400() {
    let app = app().await;

    let response = app.oneshot(get("/api/users")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        problem(response).await.detail,
        "Authorization ヘッダーがありません"
    );
}

#[tokio::test]
async fn test_bearer形式でない場合は400() {
    let app = app().await;
    let mut request = get("/api/users");
    request
        .headers_mut()
        .insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_期限切れのトークンは401() {
    let app = app().await;
    let mut claims = valid_claims();
    claims["iat"] = json!(now() - 600);
    claims["exp"] = json!(now() - 10);

    let response = app
        .oneshot(with_bearer(get("/api/users"), &sign(&claims)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let problem = problem(response).await;
    assert_eq!(problem.title, "Unauthorized");
    assert_eq!(problem.instance, "/api/users");
}

#[tokio::test]
async fn test_許可されていない発行者のトークンは401() {
    let app = app().await;
    let mut claims = valid_claims();
    claims["iss"] = json!("https://evil.example.com");

    let response = app
        .oneshot(with_bearer(get("/api/users"), &sign(&claims)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_別の鍵で署名されたトークンは401() {
    let app = app().await;

    let response = app
        .oneshot(with_bearer(
            get("/api/users"),
            &sign_with_foreign_key(&valid_claims()),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_jwtとして解析できないトークンは401() {
    let app = app().await;

    let response = app
        .oneshot(with_bearer(get("/api/users"), "not-a-jwt"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_jwk_setを取得できない場合は500() {
    let app = api_router(&auth_config(&unreachable_jwks_uri()), &test_telemetry());

    let response = app
        .oneshot(with_bearer(get("/api/users"), &sign(&valid_claims())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(problem(response).await.detail, "内部エラーが発生しました");
}

#[tokio::test]
async fn test_契約に無いパスは認証より先に404になる() {
    let app = app().await;

    let response = app.oneshot(get("/api/groups")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
