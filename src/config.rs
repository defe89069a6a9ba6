//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RLM__*` 覆盖（双下划线表示嵌套，如 `RLM__ENGINE__CHUNK_SIZE=40000`）。
//! 提供方凭据不放配置文件，直接读 OPENAI_API_KEY / ANTHROPIC_API_KEY。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::AgentConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// [llm] 段：默认模型、提供方端点、超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub default_model: String,
    pub openai_base_url: Option<String>,
    /// Anthropic Messages API 地址（代理时覆盖）
    pub anthropic_base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            openai_base_url: None,
            anthropic_base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_model() -> String {
    "gpt-4-turbo-preview".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次模型请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

/// [engine] 段：文档上限、分块阈值、递归深度、超时
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// 文档最大字符数
    #[serde(default = "default_max_context_size")]
    pub max_context_size: usize,
    /// 委派 prompt 超过此字符数时递归生成子 Agent
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: u32,
    /// 整个沙箱运行的超时（秒）
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout: u64,
    /// 单次 delegate 的超时（秒）
    #[serde(default = "default_delegate_timeout")]
    pub delegate_timeout: u64,
    /// 脚本操作数上限，0 表示不限
    #[serde(default)]
    pub max_operations: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_context_size: default_max_context_size(),
            chunk_size: default_chunk_size(),
            max_recursion_depth: default_max_recursion_depth(),
            execution_timeout: default_execution_timeout(),
            delegate_timeout: default_delegate_timeout(),
            max_operations: 0,
        }
    }
}

fn default_max_context_size() -> usize {
    500_000
}

fn default_chunk_size() -> usize {
    50_000
}

fn default_max_recursion_depth() -> u32 {
    10
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_delegate_timeout() -> u64 {
    120
}

/// [store] 段：持久化位置（需要 async-sqlite feature）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    /// 如 `sqlite:rlm.db?mode=rwc`；未设置时使用内存存储
    pub database_url: Option<String>,
}

impl AppConfig {
    /// 由配置生成一次运行的 AgentConfig；model 为 None 时用默认模型
    pub fn agent_config(&self, model: Option<&str>) -> AgentConfig {
        AgentConfig {
            model: model
                .map(String::from)
                .unwrap_or_else(|| self.llm.default_model.clone()),
            max_chunk_size: self.engine.chunk_size,
            max_recursion_depth: self.engine.max_recursion_depth,
            execution_timeout: Duration::from_secs(self.engine.execution_timeout),
            delegate_timeout: Duration::from_secs(self.engine.delegate_timeout),
            max_operations: self.engine.max_operations,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RLM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RLM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
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
        config::Environment::with_prefix("RLM")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.chunk_size, 50_000);
        assert_eq!(cfg.engine.max_recursion_depth, 10);
        assert_eq!(cfg.engine.execution_timeout, 300);
        assert_eq!(cfg.engine.delegate_timeout, 120);
        assert_eq!(cfg.llm.timeouts.request, 120);
        assert!(cfg.store.database_url.is_none());
        assert!(cfg.llm.anthropic_base_url.is_none());
    }

    #[test]
    fn test_agent_config_from_sections() {
        let cfg = AppConfig::default();
        let agent = cfg.agent_config(Some("gpt-4o"));
        assert_eq!(agent.model, "gpt-4o");
        assert_eq!(agent.max_chunk_size, 50_000);
        assert_eq!(agent.execution_timeout, Duration::from_secs(300));
        assert!(agent.validate().is_ok());

        let agent = cfg.agent_config(None);
        assert_eq!(agent.model, cfg.llm.default_model);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nchunk_size = 1234\nmax_recursion_depth = 3\n\n[llm]\ndefault_model = \"claude-3-haiku-20240307\"\nanthropic_base_url = \"http://localhost:9000/v1/messages\""
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.chunk_size, 1234);
        assert_eq!(cfg.engine.max_recursion_depth, 3);
        assert_eq!(cfg.engine.execution_timeout, 300);
        assert_eq!(cfg.llm.default_model, "claude-3-haiku-20240307");
        assert_eq!(
            cfg.llm.anthropic_base_url.as_deref(),
            Some("http://localhost:9000/v1/messages")
        );
    }
}
