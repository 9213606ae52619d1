//! # UserHub ドメイン層
//!
//! ユーザー管理のドメインモデルを定義する。
//!
//! ## 依存関係の方向
//!
//! ```text
//! user-service → infra → domain
//! ```
//!
//! ドメイン層はインフラ層（ストア、外部サービス）には一切依存しない。
//!
//! ## モジュール構成
//!
//! - [`error`] - ドメイン層で発生するエラーの定義
//! - [`user`] - ユーザーエンティティと値オブジェクト
//!
//! ## 使用例
//!
//! ```rust
//! use userhub_domain::{
//!     DomainError,
//!     user::{User, UserId, UserName},
//! };
//!
//! let user = User::new(UserId::new(1), UserName::new("alice").unwrap());
//! assert_eq!(user.name().as_str(), "alice");
//!
//! let error = DomainError::NotFound {
//!     entity_type: "User",
//!     id:          "42".to_string(),
//! };
//! assert_eq!(error.to_string(), "User が見つかりません: 42");
//! ```

pub mod error;
pub mod user;

pub use error::DomainError;
