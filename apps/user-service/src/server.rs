//! # HTTP サーバー
//!
//! 1 つのリスナーで 1 つのルーターを提供するサーバー。
//! 接続は hyper-util の `auto::Builder` で処理する（HTTP/1.1 と HTTP/2）。
//!
//! ## ライフサイクル
//!
//! ```text
//! Idle ──start──▶ Running ──stop──▶ Stopped
//!   └──────────stop──────────────────▲
//! ```
//!
//! - `start` はバインドに失敗するか、停止が要求されるまで戻らない
//! - `stop` は処理中のリクエストの完了を猶予時間まで待つ。猶予時間を超えた
//!   場合は残りの接続を打ち切り、[`ServerError::ShutdownTimeout`] を返す
//! - 起動前の `stop` は何もしない
//!
//! ## 接続のタイムアウト
//!
//! - ヘッダー読み込み: `header_read_timeout` 以内にリクエストヘッダーを
//!   受信できない接続は閉じる
//! - アイドル: 処理中のリクエストが無い状態が `idle_timeout` 続いた接続は閉じる

use std::{
    convert::Infallible,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    extract::ConnectInfo,
    http::Request,
    response::Response,
};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};
use tower::ServiceExt;

use crate::config::ServerConfig;

/// 停止待ちで猶予時間に加えて待つ時間
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// 接続の受け付けに失敗した後、次の受け付けまで待つ時間
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// サーバーのエラー
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{name} サーバーが {addr} で待ち受けできません: {source}")]
    Bind {
        name:   String,
        addr:   SocketAddr,
        source: io::Error,
    },

    #[error("{name} サーバーは既に起動されています")]
    AlreadyStarted { name: String },

    #[error("{name} サーバーの停止が {grace:?} 以内に完了しませんでした")]
    ShutdownTimeout { name: String, grace: Duration },
}

/// サーバーの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running(SocketAddr),
    /// `forced` は猶予時間内に停止できず接続を打ち切ったか
    Stopped { forced: bool },
}

/// 接続とシャットダウンのタイムアウト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub header_read_timeout: Duration,
    pub idle_timeout:        Duration,
    pub shutdown_grace:      Duration,
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            header_read_timeout: config.read_timeout(),
            idle_timeout:        config.idle_timeout(),
            shutdown_grace:      config.shutdown_grace(),
        }
    }
}

/// HTTP サーバー
pub struct HttpServer {
    name:     String,
    addr:     SocketAddr,
    router:   Mutex<Option<Router>>,
    options:  ServerOptions,
    shutdown: watch::Sender<bool>,
    state:    watch::Sender<ServerState>,
}

impl HttpServer {
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        router: Router,
        options: ServerOptions,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            router: Mutex::new(Some(router)),
            options,
            shutdown: watch::Sender::new(false),
            state: watch::Sender::new(ServerState::Idle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// 待ち受け中のアドレス（起動前・停止後は `None`）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.state() {
            ServerState::Running(addr) => Some(addr),
            ServerState::Idle | ServerState::Stopped { .. } => None,
        }
    }

    /// 待ち受けを開始するまで待ち、そのアドレスを返す
    ///
    /// 待ち受けを開始せずに停止した場合は `None`。
    pub async fn wait_until_listening(&self) -> Option<SocketAddr> {
        let mut state = self.state.subscribe();
        let current = *state
            .wait_for(|state| *state != ServerState::Idle)
            .await
            .ok()?;
        match current {
            ServerState::Running(addr) => Some(addr),
            ServerState::Idle | ServerState::Stopped { .. } => None,
        }
    }

    /// サーバーを起動する
    ///
    /// 停止が要求されるまで戻らない。
    pub async fn start(&self) -> Result<(), ServerError> {
        let router = self
            .router
            .lock()
            .ok()
            .and_then(|mut router| router.take())
            .ok_or_else(|| ServerError::AlreadyStarted {
                name: self.name.clone(),
            })?;

        let bind_error = |source| ServerError::Bind {
            name: self.name.clone(),
            addr: self.addr,
            source,
        };
        let listener = TcpListener::bind(self.addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        // start の future が途中で破棄された場合も停止済みにする
        let _stopped = StoppedOnDrop(&self.state);
        self.state.send_replace(ServerState::Running(local_addr));
        tracing::info!(server = %self.name, addr = %local_addr, "サーバーを起動しました");

        let mut deadline = self.shutdown.subscribe();
        let grace = self.options.shutdown_grace;

        let forced = tokio::select! {
            () = self.serve(listener, router) => false,
            () = async move {
                if deadline.wait_for(|stop| *stop).await.is_ok() {
                    tokio::time::sleep(grace).await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {
                tracing::warn!(
                    server = %self.name,
                    grace = ?grace,
                    "猶予時間内に停止できなかったため接続を打ち切ります"
                );
                true
            }
        };

        self.state.send_replace(ServerState::Stopped { forced });
        tracing::info!(server = %self.name, "サーバーを停止しました");
        Ok(())
    }

    /// サーバーを停止する
    ///
    /// 起動前に呼ばれた場合は、以降の `start` が即座に停止するようにして戻る。
    pub async fn stop(&self) -> Result<(), ServerError> {
        self.shutdown.send_replace(true);

        let mut state = self.state.subscribe();
        if *state.borrow() == ServerState::Idle {
            return Ok(());
        }

        let timeout = ServerError::ShutdownTimeout {
            name:  self.name.clone(),
            grace: self.options.shutdown_grace,
        };
        let stopped = tokio::time::timeout(
            self.options.shutdown_grace + STOP_MARGIN,
            state.wait_for(|state| matches!(state, ServerState::Stopped { .. })),
        )
        .await;

        match stopped {
            Ok(Ok(state)) if *state == (ServerState::Stopped { forced: false }) => Ok(()),
            _ => Err(timeout),
        }
    }

    /// 停止が要求されるまで接続を受け付け、その後すべての接続の終了を待つ
    ///
    /// この future が破棄されると、残りの接続は打ち切られる。
    async fn serve(&self, listener: TcpListener, router: Router) {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.options.header_read_timeout)
            .keep_alive(true);

        let mut shutdown = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => break,

                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            tracing::warn!(server = %self.name, %error, "接続を受け付けられません");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        builder.clone(),
                        stream,
                        remote,
                        router.clone(),
                        self.options.idle_timeout,
                        self.shutdown.subscribe(),
                    ));
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        tracing::debug!(
            server = %self.name,
            connections = connections.len(),
            "処理中の接続の終了を待ちます"
        );
        while connections.join_next().await.is_some() {}
    }
}

/// 1 つの接続を処理する
///
/// 停止要求またはアイドルタイムアウトで、処理中のリクエストを終えてから閉じる。
async fn serve_connection(
    builder: auto::Builder<TokioExecutor>,
    stream: TcpStream,
    remote: SocketAddr,
    router: Router,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let in_flight = Arc::new(watch::Sender::new(0_usize));
    let service = ConnectionService {
        router,
        remote,
        in_flight: in_flight.clone(),
    };

    let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(connection);
    let idle = wait_idle(in_flight.subscribe(), idle_timeout);
    tokio::pin!(idle);

    let mut closing = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(error) = result {
                    tracing::debug!(client.address = %remote, %error, "接続がエラーで終了しました");
                }
                return;
            }
            _ = shutdown.wait_for(|stop| *stop), if !closing => {
                connection.as_mut().graceful_shutdown();
                closing = true;
            }
            () = &mut idle, if !closing => {
                tracing::debug!(client.address = %remote, "アイドル状態の接続を閉じます");
                connection.as_mut().graceful_shutdown();
                closing = true;
            }
        }
    }
}

/// 処理中のリクエストが無い状態が `timeout` 続くまで待つ
async fn wait_idle(mut in_flight: watch::Receiver<usize>, timeout: Duration) {
    loop {
        if in_flight.wait_for(|count| *count == 0).await.is_err() {
            return std::future::pending().await;
        }
        if tokio::time::timeout(timeout, in_flight.changed()).await.is_err() {
            return;
        }
    }
}

/// 接続元アドレスを付与し、処理中のリクエスト数を数える hyper Service
struct ConnectionService {
    router:    Router,
    remote:    SocketAddr,
    in_flight: Arc<watch::Sender<usize>>,
}

impl hyper::service::Service<Request<Incoming>> for ConnectionService {
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
    type Response = Response;

    fn call(&self, mut request: Request<Incoming>) -> Self::Future {
        request.extensions_mut().insert(ConnectInfo(self.remote));
        let guard = InFlightGuard::enter(self.in_flight.clone());
        let router = self.router.clone();

        Box::pin(async move {
            let response = router.oneshot(request).await;
            drop(guard);
            response
        })
    }
}

/// 処理中のリクエスト数を増やし、ドロップ時に減らす
struct InFlightGuard(Arc<watch::Sender<usize>>);

impl InFlightGuard {
    fn enter(in_flight: Arc<watch::Sender<usize>>) -> Self {
        in_flight.send_modify(|count| *count += 1);
        Self(in_flight)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// ドロップ時に実行中の状態を停止済みにする
struct StoppedOnDrop<'a>(&'a watch::Sender<ServerState>);

impl Drop for StoppedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if matches!(state, ServerState::Running(_)) {
                *state = ServerState::Stopped { forced: false };
                true
            } else {
                false
            }
        });
    }
}
