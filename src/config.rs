//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ADMISSION__STALE_AFTER_SECS=600`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub admission: AdmissionSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub broadcast: BroadcastSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

/// [admission] 段：过期窗口与重连窗口
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    /// 超过该秒数未更新的非终态执行不再阻塞新提交（不会被自动取消）
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// 重连标记的有效期（秒）
    #[serde(default = "default_reconnect_window_secs")]
    pub reconnect_window_secs: u64,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            reconnect_window_secs: default_reconnect_window_secs(),
        }
    }
}

fn default_stale_after_secs() -> u64 {
    20 * 60
}

fn default_reconnect_window_secs() -> u64 {
    120
}

/// [dispatch] 段：队列名与 Holistic 步数上限
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_holistic_queue")]
    pub holistic_queue: String,
    #[serde(default = "default_single_agent_queue")]
    pub single_agent_queue: String,
    #[serde(default = "default_holistic_max_steps")]
    pub holistic_max_steps: u32,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            holistic_queue: default_holistic_queue(),
            single_agent_queue: default_single_agent_queue(),
            holistic_max_steps: default_holistic_max_steps(),
        }
    }
}

fn default_holistic_queue() -> String {
    "research-coordinator".to_string()
}

fn default_single_agent_queue() -> String {
    "single-agent".to_string()
}

fn default_holistic_max_steps() -> u32 {
    50
}

/// [storage] 段：SQLite 路径（需启用 async-sqlite feature），未设置时用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    pub database_path: Option<PathBuf>,
}

/// [broadcast] 段
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastSection {
    #[serde(default = "default_broadcast_capacity")]
    pub capacity: usize,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            capacity: default_broadcast_capacity(),
        }
    }
}

fn default_broadcast_capacity() -> usize {
    256
}

/// [worker] 段：进程内 worker 并发数
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.admission.stale_after_secs, 1200);
        assert_eq!(cfg.dispatch.holistic_queue, "research-coordinator");
        assert_eq!(cfg.dispatch.holistic_max_steps, 50);
        assert!(cfg.storage.database_path.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            "[admission]\nstale_after_secs = 60\n\n[dispatch]\nsingle_agent_queue = \"simple\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.admission.stale_after_secs, 60);
        assert_eq!(cfg.admission.reconnect_window_secs, 120);
        assert_eq!(cfg.dispatch.single_agent_queue, "simple");
        assert_eq!(cfg.dispatch.holistic_queue, "research-coordinator");
    }
}
