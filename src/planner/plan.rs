//! 计划与派发指令：Plan、Assignment，以及 LLM 输出解析
//!
//! LLM 可能把 JSON 包在 ```json ... ``` 里，也可能把指令写成对象或裸字符串，这里统一成 Assignment。

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::planner::PlannerError;

/// 具体任务：技能名 + 派发理由
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOrder {
    pub task: String,
    pub purpose: String,
}

impl TaskOrder {
    pub fn new(task: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            purpose: purpose.into(),
        }
    }
}

/// 单个 Agent 的指令：具体任务或空操作哨兵
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    Task(TaskOrder),
    Wait,
    Continue,
}

impl Assignment {
    /// 由 task / purpose 构造；空任务、wait、continue 均视为哨兵
    pub fn from_parts(task: Option<&str>, purpose: Option<&str>) -> Self {
        let task = task.map(str::trim).unwrap_or_default();
        match task.to_ascii_lowercase().as_str() {
            "" | "wait" => Assignment::Wait,
            "continue" => Assignment::Continue,
            _ => Assignment::Task(TaskOrder::new(task, purpose.unwrap_or_default().trim())),
        }
    }

    pub fn is_noop(&self) -> bool {
        !matches!(self, Assignment::Task(_))
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assignment::Task(order) if order.purpose.is_empty() => f.write_str(&order.task),
            Assignment::Task(order) => write!(f, "{} ({})", order.task, order.purpose),
            Assignment::Wait => f.write_str("wait"),
            Assignment::Continue => f.write_str("continue"),
        }
    }
}

/// Planner Brain 的一次输出
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub thought: String,
    pub assignments: BTreeMap<String, Assignment>,
}

impl Plan {
    /// 安全默认：给定的每个 Agent 都 wait
    pub fn all_wait<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            thought: String::new(),
            assignments: names
                .into_iter()
                .map(|n| (n.into(), Assignment::Wait))
                .collect(),
        }
    }

    /// 需要真正派发的条目
    pub fn tasks(&self) -> impl Iterator<Item = (&String, &TaskOrder)> {
        self.assignments.iter().filter_map(|(name, a)| match a {
            Assignment::Task(order) => Some((name, order)),
            _ => None,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAssignment {
    Bare(String),
    Detailed {
        #[serde(default)]
        task: Option<String>,
        #[serde(default)]
        purpose: Option<String>,
    },
    Other(serde_json::Value),
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    thought: Option<String>,
    assignments: BTreeMap<String, RawAssignment>,
}

/// 从 LLM 文本中截取 JSON：优先 ```json 围栏，其次任意 ``` 围栏，最后取首个 { 到末个 }
pub fn extract_json(output: &str) -> &str {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return rest.find("```").map(|end| &rest[..end]).unwrap_or(rest).trim();
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        return rest.find("```").map(|end| &rest[..end]).unwrap_or(rest).trim();
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// 解析 LLM 输出为 Plan
pub fn parse_plan(output: &str) -> Result<Plan, PlannerError> {
    let json = extract_json(output);
    let raw: RawPlan = serde_json::from_str(json)
        .map_err(|e| PlannerError::Malformed(format!("{e}: {json}")))?;

    let assignments = raw
        .assignments
        .into_iter()
        .map(|(name, a)| {
            let assignment = match a {
                RawAssignment::Bare(task) => Assignment::from_parts(Some(task.as_str()), None),
                RawAssignment::Detailed { task, purpose } => {
                    Assignment::from_parts(task.as_deref(), purpose.as_deref())
                }
                RawAssignment::Other(_) => Assignment::Wait,
            };
            (name, assignment)
        })
        .collect();

    Ok(Plan {
        thought: raw.thought.unwrap_or_default(),
        assignments,
    })
}
