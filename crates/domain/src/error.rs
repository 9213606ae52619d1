//! # ドメイン層エラー定義
//!
//! ビジネスルール違反やドメイン固有の例外状態を表現するエラー型。
//!
//! ## エラーの種類と HTTP ステータスの対応
//!
//! | エラー種別 | HTTP ステータス | 用途 |
//! |-----------|----------------|------|
//! | `Validation` | 400 Bad Request | 入力値の検証失敗、名前の重複 |
//! | `NotFound` | 404 Not Found | エンティティが存在しない |
//! | `Internal` | 500 Internal Server Error | ID 採番の枯渇など想定外の状態 |
//!
//! HTTP ステータスへの変換は API 層の責務であり、このクレートは関知しない。

use thiserror::Error;

/// ドメイン層で発生するエラー
///
/// API 層でこのエラーを受け取り、Problem Detail レスポンスに変換する。
#[derive(Debug, Error)]
pub enum DomainError {
    /// バリデーションエラー
    ///
    /// 入力値がビジネスルールに違反している場合に使用する。
    ///
    /// # 例
    ///
    /// - 必須フィールドが未入力
    /// - 同名のユーザーが既に存在する
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    /// エンティティが見つからない
    #[error("{entity_type} が見つかりません: {id}")]
    NotFound {
        /// エンティティの種類（"User" など）
        entity_type: &'static str,
        /// 検索に使用した識別子
        id:          String,
    },

    /// 内部エラー
    ///
    /// 呼び出し元の入力に起因しない想定外の状態。
    /// メッセージはログにのみ出力し、クライアントには返さない。
    #[error("内部エラー: {0}")]
    Internal(String),
}
