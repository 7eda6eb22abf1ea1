//! Planner Brain 的提示词模板
//!
//! system = 基础指挥官提示 + 可用技能 + 指令 + 严格 JSON 输出格式；user = 目标 + 队伍状态 + 共享背包。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::state::{AgentStatus, Inventory};

pub const DEFAULT_BASE_PROMPT: &str =
    "You are a Global Commander. Coordinate agents to achieve the goal.";

pub const NO_SKILLS: &str = "No skills available yet.";

const INSTRUCTIONS: &str = "\
INSTRUCTIONS:
1. Analyze the USER GOAL and SHARED INVENTORY.
2. Assign tasks based on dependencies.
3. EXPLAIN WHY you assigned that specific task to that agent.
4. CRITICAL: The world is PEACEFUL. Do NOT assign tasks that involve killing mobs (e.g., spiders, zombies).
5. Only agents listed as Idle can start a new task; give every other agent \"wait\".";

const OUTPUT_FORMAT: &str = r#"OUTPUT FORMAT (Strict JSON):
{
    "thought": "General strategy reasoning...",
    "assignments": {
        "AgentName1": {
            "task": "skill_name",
            "purpose": "Why this task?"
        },
        "AgentName2": {
            "task": "wait",
            "purpose": "Waiting for resources"
        }
    }
}"#;

/// 基础提示词的默认查找位置
fn default_prompt_paths() -> [PathBuf; 2] {
    [
        PathBuf::from("config/prompts/global_planner.txt"),
        PathBuf::from("../config/prompts/global_planner.txt"),
    ]
}

/// 加载基础提示词：显式路径 > 默认位置 > 内置文本
pub fn load_base_prompt(path: Option<&Path>) -> String {
    let explicit = path.map(Path::to_path_buf);
    explicit
        .into_iter()
        .chain(default_prompt_paths())
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            tracing::warn!("global_planner prompt not found, using built-in prompt");
            DEFAULT_BASE_PROMPT.to_string()
        })
}

/// 加载技能索引（纯文本）；缺失或为空时返回 NO_SKILLS
pub fn load_skills(path: Option<&Path>) -> String {
    path.and_then(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_SKILLS.to_string())
}

pub fn render_system_prompt(base_prompt: &str, skills: &str) -> String {
    format!("{base_prompt}\n\nAVAILABLE SKILLS:\n{skills}\n\n{INSTRUCTIONS}\n\n{OUTPUT_FORMAT}")
}

pub fn render_user_message(
    goal: &str,
    status: &BTreeMap<String, AgentStatus>,
    inventory: &Inventory,
) -> String {
    let status_json = serde_json::to_string(status).unwrap_or_else(|_| "{}".to_string());
    let inventory_json = serde_json::to_string(inventory).unwrap_or_else(|_| "{}".to_string());
    format!(
        "USER GOAL: {goal}\n\nCURRENT TEAM STATUS:\n{status_json}\n\nSHARED INVENTORY:\n{inventory_json}"
    )
}
