//! # HTTP リクエストハンドラ
//!
//! axum のルートに対応するハンドラ関数を定義する。
//!
//! ## 設計方針
//!
//! - 各ハンドラはサブモジュールに配置
//! - 親モジュール（この `handler.rs`）で re-export し、フラットな API を提供
//! - ハンドラは薄く保ち、入力の検証はドメイン層と契約検証ミドルウェアに委譲

pub mod actuator;
pub mod user;

pub use actuator::{ActuatorState, HealthCheck, StoreHealthCheck, health, metrics, not_found};
pub use user::{UserState, create_user, get_user, list_users};
