//! # UserHub サーバー
//!
//! ユーザー API とアクチュエーターの 2 つの HTTP サーバーを起動する。
//!
//! ## ポート
//!
//! | サーバー | 既定ポート | 内容 |
//! |---------|-----------|------|
//! | API | 8080 | `{base_url}/users` |
//! | アクチュエーター | 8081 | `/health`, `/metrics` |
//!
//! ## 環境変数
//!
//! | 変数名 | 必須 | 説明 |
//! |--------|------|------|
//! | `ACTIVE_PROFILES` | No | 有効にするプロファイル（カンマ区切り: `local`, `production`） |
//! | `APP_CONFIG_ADDITIONAL_LOCATION` | No | 追加の `application.yaml` を探すディレクトリ |
//! | `APP__<SECTION>__<KEY>` | No | 個別の設定値の上書き（例: `APP__HTTP__PORT`） |
//! | `HTTP_PORT` / `ACTUATOR_PORT` | No | 待ち受けポート |
//! | `RUST_LOG` | No | ログレベル（設定ファイルより優先） |
//!
//! ## 起動方法
//!
//! ```bash
//! # 開発環境
//! ACTIVE_PROFILES=local cargo run -p userhub-user-service
//!
//! # 本番環境
//! ACTIVE_PROFILES=production AUTH_JWK_SET_URI=https://... AUTH_ISSUER=https://... \
//!   cargo run -p userhub-user-service --release
//! ```
//!
//! ## 終了コード
//!
//! 起動・実行・停止のいずれかに失敗した場合は 1 で終了する。

use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use tracing::Instrument;
use userhub_shared::observability::{Telemetry, init_telemetry};
use userhub_user_service::{
    app::{App, shutdown_signal},
    config::AppConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    // .env ファイルを読み込む（存在しない場合は無視）
    dotenvy::dotenv().ok();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("アプリケーションが異常終了しました: {:#}", e);
            eprintln!("エラー: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("設定の読み込みに失敗しました")?;

    let telemetry =
        Arc::new(init_telemetry(&config.telemetry).context("テレメトリの初期化に失敗しました")?);
    let app_span = tracing::info_span!("app", service = %config.telemetry.service_name);

    serve(config, telemetry).instrument(app_span).await
}

async fn serve(config: AppConfig, telemetry: Arc<Telemetry>) -> anyhow::Result<()> {
    tracing::info!(
        api = %format!("{}:{}", config.http.host, config.http.port),
        actuator = %format!("{}:{}", config.actuator.host, config.actuator.port),
        base_url = %config.base_url,
        auth = config.auth.enabled,
        "UserHub を起動します"
    );

    let app = Arc::new(
        App::configure(config, telemetry).context("アプリケーションの構成に失敗しました")?,
    );

    let mut running = tokio::spawn({
        let app = app.clone();
        async move { app.start().await }.in_current_span()
    });

    // シグナル受信またはサーバーの異常終了を待つ
    let started = tokio::select! {
        () = shutdown_signal() => Ok(()),
        result = &mut running => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("サーバーの実行に失敗しました")),
            Err(e) => Err(anyhow::Error::new(e).context("サーバータスクが異常終了しました")),
        },
    };

    let stopped = app.stop().await.context("停止処理に失敗しました");
    running.abort();

    started.and(stopped)
}
