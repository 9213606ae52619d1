//! # ミドルウェア
//!
//! API サーバー・アクチュエーターサーバー用のミドルウェアを提供する。
//!
//! ## API サーバーの適用順序（外側 → 内側）
//!
//! ```text
//! recover_panic → AccessLogLayer → TraceLayer → HttpMetricsLayer
//!   → capture_request_uri → タイムアウト → validate_request
//!   → authenticate → attach_roles → label_operation → handler
//! ```

pub mod access_log;
pub mod auth;
pub mod contract;
pub mod recover;
pub mod request_uri;
pub mod roles;
pub mod telemetry;
pub mod timeout;

pub use access_log::AccessLogLayer;
pub use auth::{AuthClaims, AuthError, AuthState, authenticate};
pub use contract::validate_request;
pub use recover::recover_panic;
pub use request_uri::{capture_request_uri, current_request_uri};
pub use roles::{AuthRoles, RoleDefinitions, attach_roles};
pub use telemetry::label_operation;
pub use timeout::{WriteTimeout, enforce_write_timeout};
