//! KV 存储模块 - 基于 sled 的本地持久化键值存储
//!
//! 本模块提供：
//! - 用户隔离的 Tree（每个用户一个）
//! - 按用途划分的命名空间 `"<purpose>_<userId>"`
//! - 批量写入和前缀扫描

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use sled::{Db, Tree};
use serde::{Serialize, Deserialize};
use crate::error::{FitcoachSDKError, Result};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    /// 主数据库实例
    db: Arc<Db>,
    /// 用户专属的 Tree 实例
    user_trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path).await
            .map_err(|e| FitcoachSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 切换账号后旧实例可能刚释放锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 6;
        const RETRY_DELAY_MS: u64 = 100;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            FitcoachSDKError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        tracing::debug!("KV 存储已打开: {}", kv_path.display());

        Ok(Self {
            db: Arc::new(db),
            user_trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 初始化（或获取已打开的）用户 Tree
    pub async fn init_user_tree(&self, uid: &str) -> Result<Tree> {
        if let Some(tree) = self.user_trees.read().await.get(uid) {
            return Ok(tree.clone());
        }

        let tree_name = format!("user_{}", uid);
        let tree = self.db.open_tree(&tree_name)
            .map_err(|e| FitcoachSDKError::KvStore(format!("打开用户 Tree 失败: {}", e)))?;

        let mut user_trees = self.user_trees.write().await;
        user_trees.insert(uid.to_string(), tree.clone());

        tracing::info!("用户 KV Tree 初始化完成: {}", uid);

        Ok(tree)
    }

    /// 获取某个用户下指定用途的命名空间
    pub async fn scope(&self, uid: &str, purpose: &str) -> Result<KvScope> {
        if purpose.is_empty() || purpose.contains(':') {
            return Err(FitcoachSDKError::InvalidArgument(format!("非法的 KV 用途名: {:?}", purpose)));
        }
        let tree = self.init_user_tree(uid).await?;
        Ok(KvScope {
            tree,
            namespace: format!("{}_{}", purpose, uid),
        })
    }

    /// 将所有脏数据刷到磁盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await
            .map_err(|e| FitcoachSDKError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 用户 Tree 内一个用途的命名空间，所有键都带 `"<purpose>_<userId>:"` 前缀
#[derive(Debug, Clone)]
pub struct KvScope {
    tree: Tree,
    namespace: String,
}

impl KvScope {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    /// 设置键值对
    pub fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| FitcoachSDKError::Serialization(format!("序列化值失败: {}", e)))?;

        self.tree.insert(self.full_key(key), value_bytes)
            .map_err(|e| FitcoachSDKError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 检查键是否存在
    pub fn exists(&self, key: &str) -> Result<bool> {
        self.tree.contains_key(self.full_key(key))
            .map_err(|e| FitcoachSDKError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 批量设置键值对（单个 sled batch，原子写入）
    pub fn set_batch<K, V>(&self, pairs: Vec<(K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        let mut batch = sled::Batch::default();

        for (key, value) in pairs {
            let value_bytes = serde_json::to_vec(&value)
                .map_err(|e| FitcoachSDKError::Serialization(format!("序列化值失败: {}", e)))?;
            batch.insert(self.full_key(key.as_ref()).into_bytes(), value_bytes);
        }

        self.tree.apply_batch(batch)
            .map_err(|e| FitcoachSDKError::KvStore(format!("批量设置失败: {}", e)))?;

        Ok(())
    }

    /// 扫描命名空间内的所有键值对，返回去掉前缀后的键
    pub fn scan<V>(&self) -> Result<Vec<(String, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let prefix = self.prefix();
        let mut results = Vec::new();

        for result in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value_bytes) = result
                .map_err(|e| FitcoachSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;

            let key = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| FitcoachSDKError::Serialization(format!("反序列化值失败: {}", e)))?;

            results.push((key, value));
        }

        Ok(results)
    }

    /// 批量删除指定键
    pub fn remove_batch<K: AsRef<str>>(&self, keys: &[K]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(self.full_key(key.as_ref()).into_bytes());
        }
        self.tree.apply_batch(batch)
            .map_err(|e| FitcoachSDKError::KvStore(format!("批量删除失败: {}", e)))?;
        Ok(())
    }

    /// 清空整个命名空间，返回删除的条目数
    pub fn clear(&self) -> Result<usize> {
        let prefix = self.prefix();
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;

        for result in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = result
                .map_err(|e| FitcoachSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;
            batch.remove(key);
            removed += 1;
        }

        self.tree.apply_batch(batch)
            .map_err(|e| FitcoachSDKError::KvStore(format!("清空命名空间失败: {}", e)))?;

        Ok(removed)
    }

    /// 命名空间内的条目数
    pub fn len(&self) -> usize {
        self.tree.scan_prefix(self.prefix().as_bytes()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 刷盘，保证写入在进程重启后可见
    pub async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await
            .map_err(|e| FitcoachSDKError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 常用的命名空间用途
pub mod purposes {
    /// 已确认发送的已读标记
    pub const READ_MARKS: &str = "read_marks";
}
