//! # アプリケーション設定
//!
//! 埋め込みの YAML と環境変数から設定を組み立てる。
//!
//! ## 読み込み順序（後のものが優先）
//!
//! 1. 埋め込みの `config/application.yaml`
//! 2. `ACTIVE_PROFILES`（カンマ区切り）の各プロファイルに対応する
//!    `config/application-<profile>.yaml`
//! 3. `APP_CONFIG_ADDITIONAL_LOCATION` 配下で見つかった `application.yaml`（パス順）
//! 4. 環境変数 `APP__SECTION__KEY`（例: `APP__HTTP__PORT=9090`）
//!
//! YAML 内の `${VAR}` / `${VAR:default}` は読み込み前に環境変数で展開する。
//!
//! ## 環境変数
//!
//! | 変数名 | 必須 | 説明 |
//! |--------|------|------|
//! | `ACTIVE_PROFILES` | No | 有効にするプロファイル（`local`, `production`） |
//! | `APP_CONFIG_ADDITIONAL_LOCATION` | No | 追加の設定ファイルを探すディレクトリ |
//! | `HTTP_PORT` | No | API サーバーのポート（デフォルト: `8080`） |
//! | `ACTUATOR_PORT` | No | アクチュエーターサーバーのポート（デフォルト: `8081`） |

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File, FileFormat};
use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;
use userhub_shared::observability::TelemetryConfig;
use walkdir::WalkDir;

const BASE_CONFIG: &str = include_str!("../config/application.yaml");

/// 埋め込みのプロファイル別設定
const PROFILES: &[(&str, &str)] = &[
    ("local", include_str!("../config/application-local.yaml")),
    (
        "production",
        include_str!("../config/application-production.yaml"),
    ),
];

const ADDITIONAL_CONFIG_FILE_NAME: &str = "application.yaml";

/// `${VAR}` または `${VAR:default}`
const PLACEHOLDER_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}";

/// 設定読み込み時のエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("不明なプロファイルです: {0}")]
    UnknownProfile(String),

    #[error("{source_name} で参照している環境変数 {variable} が設定されていません")]
    MissingVariable {
        source_name: String,
        variable:    String,
    },

    #[error("追加設定ファイルを読み込めません: {path}: {source}")]
    AdditionalLocation {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("設定の読み込みに失敗しました: {0}")]
    Source(#[from] config::ConfigError),

    #[error("設定値が不正です: {0}")]
    Invalid(String),
}

/// リッスンアドレス
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl ListenConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{}:{}: {e}", self.host, self.port)))
    }
}

/// HTTP サーバーのタイムアウト設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// リクエストボディの読み取りタイムアウト
    pub read_timeout_secs:   u64,
    /// リクエスト処理（レスポンス書き込みまで）のタイムアウト
    pub write_timeout_secs:  u64,
    /// keep-alive 接続のアイドルタイムアウト
    pub idle_timeout_secs:   u64,
    /// グレースフルシャットダウンで処理中リクエストを待つ上限
    pub shutdown_grace_secs: u64,
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// ロール定義（ロール名と、そのロールを有効にする対象者）
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoleConfig {
    pub name:     String,
    pub audience: String,
}

/// 認証設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthConfig {
    pub enabled:         bool,
    #[serde(default)]
    pub jwk_set_uri:     String,
    #[serde(default)]
    pub allowed_issuers: Vec<String>,
    #[serde(default)]
    pub roles:           Vec<RoleConfig>,
}

/// アプリケーション全体の設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    /// API サーバー
    pub http:      ListenConfig,
    /// アクチュエーターサーバー（ヘルスチェック・メトリクス）
    pub actuator:  ListenConfig,
    /// API のベースパス（空文字列または `/` 始まり）
    pub base_url:  String,
    pub server:    ServerConfig,
    pub auth:      AuthConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// プロセスの環境変数から設定を読み込む
    pub fn from_env() -> Result<Self, ConfigError> {
        ConfigLoader::from_env().load()
    }

    /// 設定値を検証し、ベースパスを正規化する
    fn validate(mut self) -> Result<Self, ConfigError> {
        if !self.base_url.is_empty() && !self.base_url.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "base_url は / で始まる必要があります: {}",
                self.base_url
            )));
        }
        self.base_url = self.base_url.trim_end_matches('/').to_string();

        if self.auth.enabled {
            url::Url::parse(&self.auth.jwk_set_uri).map_err(|e| {
                ConfigError::Invalid(format!(
                    "auth.jwk_set_uri が URL として不正です: {:?}: {e}",
                    self.auth.jwk_set_uri
                ))
            })?;
            if self.auth.allowed_issuers.is_empty() {
                return Err(ConfigError::Invalid(
                    "auth.allowed_issuers を 1 つ以上指定してください".to_string(),
                ));
            }
        }

        Ok(self)
    }
}

/// 設定ローダー
///
/// テストでプロセスの環境変数に依存しないよう、参照する環境変数を保持する。
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    profiles:            Vec<String>,
    additional_location: Option<PathBuf>,
    env:                 HashMap<String, String>,
}

impl ConfigLoader {
    /// 環境変数の集合からローダーを作成する
    pub fn new(env: HashMap<String, String>) -> Self {
        let profiles = env
            .get("ACTIVE_PROFILES")
            .map(|value| parse_profiles(value))
            .unwrap_or_default();
        let additional_location = env
            .get("APP_CONFIG_ADDITIONAL_LOCATION")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        Self {
            profiles,
            additional_location,
            env,
        }
    }

    /// プロセスの環境変数からローダーを作成する
    pub fn from_env() -> Self {
        Self::new(std::env::vars().collect())
    }

    /// 設定を読み込む
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut builder =
            Config::builder().add_source(self.yaml_source("application.yaml", BASE_CONFIG)?);

        for profile in &self.profiles {
            let content = PROFILES
                .iter()
                .find(|(name, _)| *name == profile.as_str())
                .map(|(_, content)| *content)
                .ok_or_else(|| ConfigError::UnknownProfile(profile.clone()))?;
            let source_name = format!("application-{profile}.yaml");
            builder = builder.add_source(self.yaml_source(&source_name, content)?);
        }

        if let Some(location) = &self.additional_location {
            for path in collect_additional_files(location)? {
                let content = std::fs::read_to_string(&path).map_err(|source| {
                    ConfigError::AdditionalLocation {
                        path: path.clone(),
                        source,
                    }
                })?;
                builder =
                    builder.add_source(self.yaml_source(&path.display().to_string(), &content)?);
            }
        }

        let environment = Environment::with_prefix("APP")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("auth.allowed_issuers")
            .source(Some(self.env.clone().into_iter().collect()));

        let config: AppConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.validate()
    }

    fn yaml_source(
        &self,
        source_name: &str,
        content: &str,
    ) -> Result<File<config::FileSourceString, FileFormat>, ConfigError> {
        let expanded = expand_placeholders(source_name, content, |name| {
            self.env.get(name).cloned()
        })?;
        Ok(File::from_str(&expanded, FileFormat::Yaml))
    }
}

/// `ACTIVE_PROFILES` を分割し、前後の空白を除いて小文字化する
fn parse_profiles(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|profile| profile.trim().to_lowercase())
        .filter(|profile| !profile.is_empty())
        .collect()
}

/// `${VAR}` / `${VAR:default}` を展開する
fn expand_placeholders(
    source_name: &str,
    content: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let placeholder =
        Regex::new(PLACEHOLDER_PATTERN).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    let mut missing = None;

    let expanded = placeholder.replace_all(content, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(variable) => Err(ConfigError::MissingVariable {
            source_name: source_name.to_string(),
            variable,
        }),
        None => Ok(expanded.into_owned()),
    }
}

/// ディレクトリ配下の `application.yaml` を再帰的に集め、パス順に並べる
fn collect_additional_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| ConfigError::AdditionalLocation {
            path:   e.path().unwrap_or(dir).to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() && entry.file_name() == ADDITIONAL_CONFIG_FILE_NAME {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}
