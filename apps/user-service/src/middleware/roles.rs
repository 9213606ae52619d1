//! # ロール導出ミドルウェア
//!
//! 検証済みクレームの `roles` のうち、設定で定義されたロールで、かつその
//! ロールの対象者がトークンの `aud` に含まれるものだけを有効なロールとする。

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use userhub_infra::VerifiedClaims;

use crate::{config::RoleConfig, middleware::AuthClaims};

/// ロール定義（ロール名 → 対象者）
#[derive(Debug, Clone, Default)]
pub struct RoleDefinitions(Arc<HashMap<String, String>>);

impl RoleDefinitions {
    pub fn new(roles: &[RoleConfig]) -> Self {
        Self(Arc::new(
            roles
                .iter()
                .map(|role| (role.name.clone(), role.audience.clone()))
                .collect(),
        ))
    }

    /// クレームから有効なロールを導出する
    ///
    /// 順序はクレーム内の順序に従う。
    pub fn derive(&self, claims: &VerifiedClaims) -> Vec<String> {
        claims
            .roles
            .iter()
            .filter(|role| {
                self.0
                    .get(role.as_str())
                    .is_some_and(|audience| claims.audiences.contains(audience))
            })
            .cloned()
            .collect()
    }
}

/// 有効なロール（リクエスト extensions に格納される）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthRoles(pub Vec<String>);

/// 有効なロールを導出してリクエストに付与するミドルウェア
///
/// 認証されていないリクエストには空のロールを付与する。
pub async fn attach_roles(
    State(definitions): State<RoleDefinitions>,
    mut request: Request,
    next: Next,
) -> Response {
    let roles = request
        .extensions()
        .get::<AuthClaims>()
        .map(|claims| definitions.derive(&claims.0))
        .unwrap_or_default();

    request.extensions_mut().insert(AuthRoles(roles));
    next.run(request).await
}
