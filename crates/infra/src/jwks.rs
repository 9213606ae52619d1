//! # JWK Set 取得
//!
//! 認可サーバーが公開する JWK Set から RS256 検証用の公開鍵を取得し、キャッシュする。
//!
//! ## キャッシュ方針
//!
//! - 取得した鍵は TTL（既定 5 分）の間再利用する
//! - キャッシュに存在しない `kid` を要求された場合は、TTL 内でも再取得する
//!   （鍵ローテーション直後のトークンを受け付けるため）
//! - 未知の `kid` による再取得は、前回の取得から最小間隔（既定 30 秒）が
//!   経過するまで行わない
//! - 取得に失敗した場合はエラーを返す。古いキャッシュへのフォールバックは行わない

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

/// 鍵キャッシュの既定 TTL
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// 未知の `kid` による再取得の既定の最小間隔
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// JWK Set 取得時のエラー
#[derive(Debug, Error)]
pub enum JwksError {
    #[error("JWK Set の取得に失敗しました: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JWK Set の形式が不正です: {0}")]
    Format(String),
}

/// JWK Set ドキュメント
#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// JWK Set 内の個々の鍵
///
/// RS256 検証に必要なフィールドのみを扱う。
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty:     String,
    #[serde(default)]
    pub kid:     Option<String>,
    #[serde(default)]
    pub alg:     Option<String>,
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,
    #[serde(default)]
    pub n:       Option<String>,
    #[serde(default)]
    pub e:       Option<String>,
}

/// JWK Set の取得元
///
/// HTTP 実装のほか、テストでは固定の鍵セットを返す実装に差し替える。
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, JwksError>;
}

/// HTTP で JWK Set を取得する実装
#[derive(Debug, Clone)]
pub struct HttpJwksFetcher {
    client: reqwest::Client,
    uri:    String,
}

impl HttpJwksFetcher {
    /// 新しいフェッチャーを作成する
    ///
    /// 認可サーバーの応答が遅い場合にリクエスト処理が滞留しないよう、
    /// 取得には 5 秒のタイムアウトを設ける。
    pub fn new(uri: impl Into<String>) -> Result<Self, JwksError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            uri: uri.into(),
        })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<JwkSet, JwksError> {
        let set = self
            .client
            .get(&self.uri)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        Ok(set)
    }
}

struct CachedKeys {
    fetched_at: Instant,
    keys:       HashMap<String, DecodingKey>,
}

/// `kid` から検証鍵を引く TTL 付きキャッシュ
pub struct JwksKeyStore {
    fetcher:              Arc<dyn JwksFetcher>,
    ttl:                  Duration,
    min_refresh_interval: Duration,
    cache:                Mutex<Option<CachedKeys>>,
}

impl JwksKeyStore {
    pub fn new(fetcher: Arc<dyn JwksFetcher>) -> Self {
        Self::with_ttl(fetcher, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(fetcher: Arc<dyn JwksFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            cache: Mutex::new(None),
        }
    }

    /// 未知の `kid` による再取得の最小間隔を変更する
    #[cfg(test)]
    fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// `kid` に対応する検証鍵を返す
    ///
    /// - `Ok(Some(key))`: 鍵が見つかった
    /// - `Ok(None)`: 再取得しても鍵が見つからない、または最小間隔内のため再取得しなかった
    /// - `Err(_)`: JWK Set の取得に失敗した
    pub async fn key_for(&self, kid: &str) -> Result<Option<DecodingKey>, JwksError> {
        // 取得中の並行リクエストが同時に再取得しないよう、ロックを保持したまま取得する
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                if let Some(key) = cached.keys.get(kid) {
                    return Ok(Some(key.clone()));
                }
                if cached.fetched_at.elapsed() < self.min_refresh_interval {
                    tracing::debug!(kid, "未知の kid ですが、前回の取得から間もないため再取得しません");
                    return Ok(None);
                }
                tracing::debug!(kid, "未知の kid のため JWK Set を再取得します");
            }
        }

        let refreshed = self.refresh().await?;
        let key = refreshed.keys.get(kid).cloned();
        *cache = Some(refreshed);
        Ok(key)
    }

    async fn refresh(&self) -> Result<CachedKeys, JwksError> {
        let set = self.fetcher.fetch().await?;
        let keys = decoding_keys(&set)?;
        tracing::debug!(keys = keys.len(), "JWK Set を取得しました");
        Ok(CachedKeys {
            fetched_at: Instant::now(),
            keys,
        })
    }
}

/// JWK Set から RS256 の署名検証鍵を抽出する
///
/// RSA 以外の鍵、`kid` を持たない鍵、署名用途でない鍵はスキップする。
fn decoding_keys(set: &JwkSet) -> Result<HashMap<String, DecodingKey>, JwksError> {
    let mut keys = HashMap::new();

    for jwk in &set.keys {
        let Some(kid) = jwk.kid.as_deref() else {
            continue;
        };
        if !jwk.kty.eq_ignore_ascii_case("RSA") {
            tracing::debug!(kid, kty = %jwk.kty, "RSA 以外の鍵をスキップします");
            continue;
        }
        if jwk.alg.as_deref().is_some_and(|alg| alg != "RS256") {
            continue;
        }
        if jwk.key_use.as_deref().is_some_and(|key_use| key_use != "sig") {
            continue;
        }
        let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
            return Err(JwksError::Format(format!(
                "kid={kid} の RSA 鍵に n または e がありません"
            )));
        };
        let key = DecodingKey::from_rsa_components(n, e)
            .map_err(|e| JwksError::Format(format!("kid={kid}: {e}")))?;
        keys.insert(kid.to_string(), key);
    }

    Ok(keys)
}
