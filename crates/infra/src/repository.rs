//! # リポジトリ実装
//!
//! ユーザーを保持するストアのトレイトと実装を提供する。
//!
//! - **依存性逆転**: ハンドラはトレイト経由でストアを利用する
//! - **テスタビリティ**: トレイト経由でモック可能な設計

pub mod user_repository;

pub use user_repository::{InMemoryUserRepository, UserRepository};
