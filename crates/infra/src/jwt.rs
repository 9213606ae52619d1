//! # アクセストークン検証
//!
//! Bearer トークンとして提示された JWT を検証し、認証済みクレームを取り出す。
//!
//! ## 検証内容
//!
//! - 署名アルゴリズムは RS256 のみ受け付ける
//! - ヘッダーの `kid` に対応する鍵を JWK Set から取得して署名を検証する
//! - `iss` が許可された発行者のいずれかであること
//! - `exp` / `nbf` / `iat` は存在する場合のみ検証し、時刻の許容誤差は設けない
//!
//! `aud` は検証せず、ロール導出のためにそのまま呼び出し元へ渡す。

use jsonwebtoken::{Algorithm, Validation, decode, decode_header, get_current_timestamp};
use serde::Deserialize;
use thiserror::Error;

use crate::jwks::{JwksError, JwksKeyStore};

/// トークン検証の失敗
///
/// `KeySet` 以外はクライアントが提示したトークンに起因する失敗。
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("トークンの形式が不正です: {0}")]
    Malformed(String),

    #[error("サポートされていない署名アルゴリズムです: {0}")]
    UnsupportedAlgorithm(String),

    #[error("署名鍵が見つかりません: kid={0}")]
    UnknownKey(String),

    #[error("トークンの検証に失敗しました: {0}")]
    Invalid(String),

    #[error(transparent)]
    KeySet(#[from] JwksError),
}

/// `aud` クレーム（単一文字列または配列）
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(aud) => vec![aud],
            Self::Many(auds) => auds,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub:   Option<String>,
    #[serde(default)]
    aud:   Option<Audience>,
    #[serde(default)]
    iat:   Option<u64>,
    #[serde(default)]
    roles: Vec<String>,
}

/// 検証済みのクレーム
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifiedClaims {
    /// 主体（`sub`）
    pub subject:   Option<String>,
    /// 対象者（`aud`）。単一文字列の場合も 1 要素の配列に正規化する
    pub audiences: Vec<String>,
    /// トークンに含まれるロール名（`roles`）
    pub roles:     Vec<String>,
}

/// JWT 検証器
pub struct JwtVerifier {
    keys:            JwksKeyStore,
    allowed_issuers: Vec<String>,
}

impl JwtVerifier {
    pub fn new(keys: JwksKeyStore, allowed_issuers: Vec<String>) -> Self {
        Self {
            keys,
            allowed_issuers,
        }
    }

    /// トークンを検証し、クレームを返す
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, TokenError> {
        let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;

        if header.alg != Algorithm::RS256 {
            return Err(TokenError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let kid = header.kid.unwrap_or_default();
        let key = self
            .keys
            .key_for(&kid)
            .await?
            .ok_or_else(|| TokenError::UnknownKey(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.set_issuer(self.allowed_issuers.as_slice());

        let data = decode::<RawClaims>(token, &key, &validation)
            .map_err(|e| TokenError::Invalid(e.to_string()))?;
        let claims = data.claims;

        if claims.iat.is_some_and(|iat| iat > get_current_timestamp()) {
            return Err(TokenError::Invalid(
                "トークンの発行時刻が未来です".to_string(),
            ));
        }

        Ok(VerifiedClaims {
            subject:   claims.sub,
            audiences: claims.aud.map(Audience::into_vec).unwrap_or_default(),
            roles:     claims.roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jsonwebtoken::{EncodingKey, Header, encode};
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use super::*;
    use crate::jwks::tests::StaticFetcher;

    const SIGNING_KEY: &[u8] = include_bytes!("../tests/fixtures/signing_key.pem");
    const FOREIGN_KEY: &[u8] = include_bytes!("../tests/fixtures/foreign_key.pem");
    const ISSUER: &str = "https://issuer.example.com";

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(
            JwksKeyStore::new(Arc::new(StaticFetcher::fixture())),
            vec![ISSUER.to_string()],
        )
    }

    fn sign_with(key: &[u8], kid: &str, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &EncodingKey::from_rsa_pem(key).unwrap()).unwrap()
    }

    fn sign(claims: &Value) -> String {
        sign_with(SIGNING_KEY, "test-key-1", claims)
    }

    fn now() -> u64 {
        get_current_timestamp()
    }

    #[tokio::test]
    async fn test_正しいトークンからクレームを取り出せる() {
        let token = sign(&json!({
            "iss": ISSUER,
            "sub": "user-1",
            "aud": ["api://users", "api://admin"],
            "iat": now(),
            "exp": now() + 300,
            "roles": ["reader"],
        }));

        let claims = verifier().verify(&token).await.unwrap();

        assert_eq!(
            claims,
            VerifiedClaims {
                subject:   Some("user-1".to_string()),
                audiences: vec!["api://users".to_string(), "api://admin".to_string()],
                roles:     vec!["reader".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_単一文字列のaudは配列に正規化される() {
        let token = sign(&json!({ "iss": ISSUER, "aud": "api://users" }));

        let claims = verifier().verify(&token).await.unwrap();

        assert_eq!(claims.audiences, vec!["api://users".to_string()]);
        assert!(claims.roles.is_empty());
    }

    #[tokio::test]
    async fn test_期限切れのトークンは無効() {
        let token = sign(&json!({ "iss": ISSUER, "exp": now() - 60 }));

        let result = verifier().verify(&token).await;

        assert!(matches!(result, Err(TokenError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_有効期間開始前のトークンは無効() {
        let token = sign(&json!({ "iss": ISSUER, "nbf": now() + 600 }));

        let result = verifier().verify(&token).await;

        assert!(matches!(result, Err(TokenError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_発行時刻が未来のトークンは無効() {
        let token = sign(&json!({ "iss": ISSUER, "iat": now() + 600 }));

        let result = verifier().verify(&token).await;

        assert!(matches!(result, Err(TokenError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_許可されていない発行者のトークンは無効() {
        let token = sign(&json!({ "iss": "https://evil.example.com" }));

        let result = verifier().verify(&token).await;

        assert!(matches!(result, Err(TokenError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_別の鍵で署名されたトークンは無効() {
        let token = sign_with(FOREIGN_KEY, "test-key-1", &json!({ "iss": ISSUER }));

        let result = verifier().verify(&token).await;

        assert!(matches!(result, Err(TokenError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_未知のkidは鍵なしエラー() {
        let token = sign_with(SIGNING_KEY, "unknown-kid", &json!({ "iss": ISSUER }));

        let result = verifier().verify(&token).await;

        assert!(matches!(result, Err(TokenError::UnknownKey(kid)) if kid == "unknown-kid"));
    }

    #[tokio::test]
    async fn test_hs256のトークンはアルゴリズムエラー() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "iss": ISSUER }),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let result = verifier().verify(&token).await;

        assert!(matches!(result, Err(TokenError::UnsupportedAlgorithm(_))));
    }

    #[tokio::test]
    async fn test_jwtでない文字列は形式エラー() {
        let result = verifier().verify("not-a-jwt").await;

        assert!(matches!(result, Err(TokenError::Malformed(_))));
    }
}
