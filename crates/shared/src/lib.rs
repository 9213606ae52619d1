//! # UserHub 共有ユーティリティ
//!
//! ワークスペース全体で使用される共通ユーティリティを提供する。
//!
//! ## 設計方針
//!
//! - ビジネスロジックを含まない純粋なユーティリティのみを配置
//! - axum には依存しない（HTTP 型は `http` クレートのものを使う）
//! - テレメトリ関連は `observability` feature 有効時のみ提供する

pub mod error_response;
pub mod health;
#[cfg(feature = "observability")]
pub mod metrics;
#[cfg(feature = "observability")]
pub mod observability;

pub use error_response::{PROBLEM_JSON_CONTENT_TYPE, ProblemDetail};
pub use health::{CheckStatus, HealthResponse, ServingStatus};
