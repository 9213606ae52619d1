//! # UserRepository
//!
//! ユーザー情報の保持を担当するリポジトリ。
//!
//! ## 設計方針
//!
//! - **プロセス内保持**: 永続化は行わず、プロセス終了とともに破棄される
//! - **原子的な作成**: 名前の重複チェック・ID 採番・挿入を単一の書き込みロック内で行う
//! - **連番採番**: ID は 1 から始まる単調増加のカウンタで割り当てる

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use userhub_domain::{
    DomainError,
    user::{User, UserId, UserName},
};

/// ユーザーリポジトリトレイト
///
/// ユーザー情報の保持操作を定義する。
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// ユーザーを作成する
    ///
    /// # 戻り値
    ///
    /// - `Ok(user)`: 採番済みの ID を持つ作成済みユーザー
    /// - `Err(DomainError::Validation)`: 同名のユーザーが既に存在する
    /// - `Err(DomainError::Internal)`: ID を採番できない
    async fn create(&self, name: UserName) -> Result<User, DomainError>;

    /// ID でユーザーを検索する
    ///
    /// 見つからない場合は `DomainError::NotFound` を返す。
    async fn find_by_id(&self, id: UserId) -> Result<User, DomainError>;

    /// 全ユーザーを ID 順で取得する
    async fn find_all(&self) -> Vec<User>;

    /// 保持しているユーザー数を返す
    async fn count(&self) -> usize;
}

#[derive(Debug)]
struct Entries {
    next_id: i32,
    users:   BTreeMap<UserId, User>,
}

/// インメモリ実装の UserRepository
#[derive(Debug)]
pub struct InMemoryUserRepository {
    entries: RwLock<Entries>,
}

impl InMemoryUserRepository {
    /// 空のリポジトリを作成する
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries {
                next_id: 1,
                users:   BTreeMap::new(),
            }),
        }
    }
}

impl Default for InMemoryUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, name: UserName) -> Result<User, DomainError> {
        let mut entries = self.entries.write().await;

        if entries.users.values().any(|user| user.name() == &name) {
            return Err(DomainError::Validation(format!(
                "ユーザー名 '{name}' は既に使用されています"
            )));
        }

        let id = UserId::new(entries.next_id);
        entries.next_id = entries
            .next_id
            .checked_add(1)
            .ok_or_else(|| DomainError::Internal("ユーザー ID を採番できません".to_string()))?;

        let user = User::new(id, name);
        entries.users.insert(id, user.clone());

        tracing::debug!(user.id = %id, "ユーザーを作成しました");
        Ok(user)
    }

    async fn find_by_id(&self, id: UserId) -> Result<User, DomainError> {
        self.entries
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound {
                entity_type: "User",
                id:          id.to_string(),
            })
    }

    async fn find_all(&self) -> Vec<User> {
        self.entries.read().await.users.values().cloned().collect()
    }

    async fn count(&self) -> usize {
        self.entries.read().await.users.len()
    }
}
