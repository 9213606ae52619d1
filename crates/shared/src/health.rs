//! # ヘルスチェック共通型
//!
//! アクチュエーターサーバーの `/health` が返すレスポンス型を提供する。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// サービス全体の稼働状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    /// 全チェックが成功
    Serving,
    /// いずれかのチェックが失敗
    NotServing,
}

/// 個別チェックの結果ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// チェック成功
    Ok,
    /// チェック失敗（タイムアウトを含む）
    Error,
}

/// ヘルスチェックレスポンス
///
/// ## 使用例
///
/// ```
/// use std::collections::BTreeMap;
///
/// use userhub_shared::{CheckStatus, HealthResponse, ServingStatus};
///
/// let mut checks = BTreeMap::new();
/// checks.insert("store".to_string(), CheckStatus::Ok);
/// let response = HealthResponse::from_checks(checks);
/// assert_eq!(response.status, ServingStatus::Serving);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// 全体のステータス
    pub status: ServingStatus,
    /// 個別チェック結果（チェック名 → ステータス）
    pub checks: BTreeMap<String, CheckStatus>,
}

impl HealthResponse {
    /// 個別チェック結果から全体のステータスを決定する
    ///
    /// チェックが 1 つも無い場合は稼働中とみなす。
    pub fn from_checks(checks: BTreeMap<String, CheckStatus>) -> Self {
        let status = if checks.values().all(|status| *status == CheckStatus::Ok) {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        };
        Self { status, checks }
    }

    pub fn is_serving(&self) -> bool {
        self.status == ServingStatus::Serving
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_全チェック成功でservingになる() {
        let checks = BTreeMap::from([
            ("store".to_string(), CheckStatus::Ok),
            ("jwks".to_string(), CheckStatus::Ok),
        ]);

        let response = HealthResponse::from_checks(checks);

        assert!(response.is_serving());
    }

    #[test]
    fn test_1つでも失敗するとnot_servingになる() {
        let checks = BTreeMap::from([
            ("store".to_string(), CheckStatus::Ok),
            ("jwks".to_string(), CheckStatus::Error),
        ]);

        let response = HealthResponse::from_checks(checks);

        assert_eq!(response.status, ServingStatus::NotServing);
    }

    #[test]
    fn test_チェックなしでもservingになる() {
        let response = HealthResponse::from_checks(BTreeMap::new());

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({ "status": "SERVING", "checks": {} })
        );
    }

    #[test]
    fn test_jsonシリアライズの形式() {
        let checks = BTreeMap::from([("store".to_string(), CheckStatus::Error)]);
        let json = serde_json::to_value(HealthResponse::from_checks(checks)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "status": "NOT_SERVING", "checks": { "store": "error" } })
        );
    }
}
