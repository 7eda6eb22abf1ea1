//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub fleet: FleetSection,
    pub dispatcher: DispatcherSection,
    pub worker: WorkerSection,
    pub planner: PlannerSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmDeepSeekSection,
    #[serde(default)]
    pub openai: LlmOpenAiSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmDeepSeekSection::default(),
            openai: LlmOpenAiSection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次规划请求超时（秒）
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
    60
}

/// 执行器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Http,
    Mock,
}

/// [[fleet.agents]] 条目
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentEndpoint {
    pub name: String,
    pub endpoint: String,
}

/// [fleet] 段：目标、静态成员、执行器类型
#[derive(Debug, Clone, Deserialize)]
pub struct FleetSection {
    #[serde(default = "default_goal")]
    pub goal: String,
    #[serde(default)]
    pub agents: Vec<AgentEndpoint>,
    #[serde(default)]
    pub executor: ExecutorKind,
    /// 相邻 Worker 启动间隔（秒），给执行器握手留时间
    #[serde(default = "default_startup_stagger_secs")]
    pub startup_stagger_secs: u64,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            goal: default_goal(),
            agents: Vec::new(),
            executor: ExecutorKind::default(),
            startup_stagger_secs: default_startup_stagger_secs(),
        }
    }
}

fn default_goal() -> String {
    "Build a iron pickaxe".to_string()
}

fn default_startup_stagger_secs() -> u64 {
    15
}

/// [dispatcher] 段
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// [worker] 段：邮箱等待、重置与请求超时
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    #[serde(default = "default_reset_wait_ticks")]
    pub reset_wait_ticks: u32,
    /// 软重置等待稳定的上限（秒）
    #[serde(default = "default_settle_timeout_secs")]
    pub settle_timeout_secs: u64,
    /// 对执行器的单次请求超时（秒），包括长任务
    #[serde(default = "default_executor_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            receive_timeout_secs: default_receive_timeout_secs(),
            reset_wait_ticks: default_reset_wait_ticks(),
            settle_timeout_secs: default_settle_timeout_secs(),
            request_timeout_secs: default_executor_request_timeout_secs(),
        }
    }
}

fn default_receive_timeout_secs() -> u64 {
    2
}

fn default_reset_wait_ticks() -> u32 {
    40
}

fn default_settle_timeout_secs() -> u64 {
    30
}

fn default_executor_request_timeout_secs() -> u64 {
    120
}

/// [planner] 段：基础提示词与技能索引文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlannerSection {
    pub prompt_path: Option<PathBuf>,
    pub skills_path: Option<PathBuf>,
}

impl DispatcherSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl WorkerSection {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// 校验静态舰队配置：至少一个 Agent，名称非空且唯一
    pub fn validate(&self) -> Result<(), String> {
        if self.fleet.agents.is_empty() {
            return Err("fleet.agents is empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.fleet.agents {
            if agent.name.trim().is_empty() {
                return Err("fleet agent with empty name".to_string());
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(format!("duplicate fleet agent name: {}", agent.name));
            }
        }
        if self.dispatcher.poll_interval_secs == 0 {
            return Err("dispatcher.poll_interval_secs must be greater than 0".to_string());
        }
        if self.worker.receive_timeout_secs == 0 {
            return Err("worker.receive_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
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
