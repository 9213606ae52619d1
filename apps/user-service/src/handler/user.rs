//! # ユーザーハンドラ
//!
//! ## エンドポイント（ベースパスからの相対パス）
//!
//! - `GET /users` - ユーザー一覧
//! - `POST /users` - ユーザーを作成
//! - `GET /users/{userid}` - ユーザーを取得

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use userhub_domain::user::{User, UserId, UserName};
use userhub_infra::repository::UserRepository;

use crate::error::ApiError;

/// ユーザー API の共有状態
#[derive(Clone)]
pub struct UserState {
    pub repository: Arc<dyn UserRepository>,
}

// --- リクエスト/レスポンス型 ---

/// ユーザー作成リクエスト
///
/// `id` は読み取り専用のため、送られてきても無視する。
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
}

/// ユーザーレスポンス
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    pub id:   i32,
    pub name: String,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id:   user.id().as_i32(),
            name: user.name().as_str().to_string(),
        }
    }
}

// --- ハンドラ ---

/// ユーザー一覧を取得する
///
/// ID の昇順で返す。
pub async fn list_users(State(state): State<UserState>) -> Json<Vec<UserResponse>> {
    let users = state.repository.find_all().await;
    Json(users.iter().map(UserResponse::from).collect())
}

/// ユーザーを作成する
///
/// 成功時は 201 を返す（ボディなし）。
pub async fn create_user(
    State(state): State<UserState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let name = UserName::new(payload.name)?;

    let user = state.repository.create(name).await?;
    tracing::info!(user.id = %user.id(), "ユーザーを作成しました");

    Ok(StatusCode::CREATED)
}

/// ユーザーを取得する
pub async fn get_user(
    State(state): State<UserState>,
    userid: Result<Path<i32>, PathRejection>,
) -> Result<Json<UserResponse>, ApiError> {
    let Path(userid) = userid.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let user = state.repository.find_by_id(UserId::new(userid)).await?;
    Ok(Json(UserResponse::from(&user)))
}
