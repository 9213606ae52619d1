//! # エラーレスポンス（RFC 7807 Problem Details）
//!
//! API サーバー・アクチュエーターサーバーで共通のエラーレスポンス構造体を提供する。
//!
//! ## 設計
//!
//! - `ProblemDetail` は純粋なデータ構造（`Serialize` / `Deserialize` のみ）
//! - axum の `IntoResponse` 変換はサービス側の責務（shared に axum 依存を入れない）
//! - `type` は常に `about:blank`、`title` はステータスコードの標準理由句

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Problem Details のメディアタイプ
pub const PROBLEM_JSON_CONTENT_TYPE: &str = "application/problem+json";

/// `type` フィールドの固定値
const ABOUT_BLANK: &str = "about:blank";

/// 500 系エラーでクライアントに返す固定メッセージ
const INTERNAL_ERROR_DETAIL: &str = "内部エラーが発生しました";

/// エラーレスポンス（RFC 7807 Problem Details）
///
/// `status` は常に HTTP レスポンスのステータスコードと一致させる。
/// `trace_id` は 32 桁の小文字 16 進数、トレースが無い場合は空文字列。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetail {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title:        String,
    pub status:       u16,
    pub detail:       String,
    pub instance:     String,
    #[serde(rename = "traceId")]
    pub trace_id:     String,
}

impl ProblemDetail {
    /// 汎用コンストラクタ
    ///
    /// `instance` と `trace_id` は空で作成される。
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            problem_type: ABOUT_BLANK.to_string(),
            title:        status.canonical_reason().unwrap_or_default().to_string(),
            status:       status.as_u16(),
            detail:       detail.into(),
            instance:     String::new(),
            trace_id:     String::new(),
        }
    }

    /// 500 Internal Server Error
    ///
    /// detail は固定値（内部情報を漏らさないため）。
    pub fn internal_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_DETAIL)
    }

    /// リクエスト URI を設定する
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// トレース ID を設定する
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}
