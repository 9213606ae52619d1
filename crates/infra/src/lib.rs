//! # UserHub インフラ層
//!
//! 外部システムとの接続・通信を担当するインフラストラクチャ層。
//!
//! ## 責務
//!
//! - **リポジトリ実装**: ユーザーを保持するインメモリストア
//! - **鍵セット取得**: 認可サーバーの JWK Set エンドポイントからの公開鍵取得
//! - **トークン検証**: RS256 署名付き JWT の検証
//!
//! ## 依存関係
//!
//! ```text
//! user-service → infra → domain
//! ```
//!
//! ## モジュール構成
//!
//! - [`repository`] - リポジトリトレイトとインメモリ実装
//! - [`jwks`] - JWK Set の取得とキャッシュ
//! - [`jwt`] - アクセストークンの検証

pub mod jwks;
pub mod jwt;
pub mod repository;

pub use jwks::{HttpJwksFetcher, JwksError, JwksFetcher, JwksKeyStore};
pub use jwt::{Audience, JwtVerifier, TokenError, VerifiedClaims};
