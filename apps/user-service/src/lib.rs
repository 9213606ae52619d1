//! # UserHub ユーザーサービス
//!
//! ユーザーの作成・参照を提供する HTTP サービス。
//!
//! ## 構成
//!
//! - API サーバー: OpenAPI 契約で検証された `/users` エンドポイント
//! - アクチュエーターサーバー: `/health` と `/metrics`
//!
//! どちらのサーバーも [`app::App`] がライフサイクルを管理する。
//!
//! ## モジュール
//!
//! - [`config`]: 設定の読み込み（埋め込み YAML + プロファイル + 環境変数）
//! - [`openapi`]: OpenAPI 契約の読み込みとリクエスト検証
//! - [`middleware`]: API サーバーのミドルウェアチェーン
//! - [`handler`]: ユーザー API とアクチュエーターのハンドラー
//! - [`app_builder`]: ルーターの組み立て
//! - [`server`]: 単一 HTTP サーバーの起動・停止
//! - [`app`]: 2 つのサーバーとテレメトリのライフサイクル

pub mod app;
pub mod app_builder;
pub mod config;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod openapi;
pub mod server;
