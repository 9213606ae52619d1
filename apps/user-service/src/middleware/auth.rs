//! # 認証ミドルウェア
//!
//! `Authorization: Bearer <token>` ヘッダーのアクセストークンを検証し、
//! 検証済みクレームをリクエスト extensions に格納する。
//!
//! ## ステータスの対応
//!
//! | 状況 | ステータス |
//! |------|-----------|
//! | ヘッダーが無い・Bearer 形式でない | 400 |
//! | トークンの署名・発行者・有効期限が不正 | 401 |
//! | JWK Set を取得できない | 500 |

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use thiserror::Error;
use userhub_infra::{JwtVerifier, TokenError, VerifiedClaims};

use crate::error::ApiError;

/// 認証ミドルウェアの状態
#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<JwtVerifier>,
}

/// 検証済みクレーム（リクエスト extensions に格納される）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims(pub VerifiedClaims);

/// 認証の失敗
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization ヘッダーがありません")]
    MissingToken,

    #[error("Authorization ヘッダーは Bearer 形式である必要があります")]
    MalformedHeader,

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken | AuthError::MalformedHeader => {
                Self::BadRequest(err.to_string())
            }
            AuthError::Token(TokenError::KeySet(e)) => Self::Internal(e.to_string()),
            AuthError::Token(e) => Self::Unauthorized(e.to_string()),
        }
    }
}

/// `Authorization` ヘッダーから Bearer トークンを取り出す
///
/// スキーム名の大文字・小文字は区別しない。
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;

    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(AuthError::MalformedHeader)?;
    let token = token.trim();

    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

/// アクセストークンを検証するミドルウェア
pub async fn authenticate(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())?;
    let claims = state
        .verifier
        .verify(token)
        .await
        .map_err(AuthError::from)?;

    tracing::debug!(
        enduser.id = claims.subject.as_deref().unwrap_or("-"),
        "アクセストークンを検証しました"
    );

    request.extensions_mut().insert(AuthClaims(claims));
    Ok(next.run(request).await)
}
