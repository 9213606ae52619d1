//! # ユーザー
//!
//! ユーザーエンティティとそれに関連する値オブジェクトを定義する。
//!
//! ## 設計方針
//!
//! - **Newtype パターン**: UserId は `i32` をラップし、型安全性を確保
//! - **不変性**: ユーザーは作成後に変更されない
//! - **バリデーション**: 値オブジェクトの生成時に検証ロジックを実行

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::DomainError;

/// ユーザー ID（一意識別子）
///
/// ストアが採番する 32 ビット整数。0 は割り当てられない。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct UserId(i32);

impl UserId {
    /// 既存の値からユーザー ID を作成する
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    /// 内部の値を取得する
    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

/// ユーザー名（値オブジェクト）
///
/// # バリデーション
///
/// - 空文字列ではない
///
/// 一意性は値オブジェクト単体では判定できないため、ストアが保証する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct UserName(String);

impl UserName {
    /// ユーザー名を作成する
    ///
    /// # エラー
    ///
    /// 空文字列の場合は `DomainError::Validation` を返す。
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();

        if value.is_empty() {
            return Err(DomainError::Validation("ユーザー名は必須です".to_string()));
        }

        Ok(Self(value))
    }

    /// 文字列参照を取得する
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 所有する文字列に変換する
    pub fn into_string(self) -> String {
        self.0
    }
}

/// ユーザーエンティティ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    id:   UserId,
    name: UserName,
}

impl User {
    /// ユーザーを作成する
    pub fn new(id: UserId, name: UserName) -> Self {
        Self { id, name }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn name(&self) -> &UserName {
        &self.name
    }
}
