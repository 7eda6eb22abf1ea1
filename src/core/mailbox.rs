//! 单槽命令邮箱：Dispatcher -> Worker
//!
//! 每个 Agent 一个，容量恰好为 1。槽位由 watch 通道承载，try_send / replace / take
//! 都在发送端的单次原子修改里完成，不存在"先清空再写入"的两步竞态。
//! 消费者只会看到最新命令。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::planner::{Assignment, TaskOrder};

/// 邮箱里的命令
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub id: Uuid,
    pub assignment: Assignment,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(assignment: Assignment) -> Self {
        Self {
            id: Uuid::new_v4(),
            assignment,
            issued_at: Utc::now(),
        }
    }

    pub fn order(task: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self::new(Assignment::Task(TaskOrder::new(task, purpose)))
    }

    /// 非哨兵命令返回任务内容
    pub fn task(&self) -> Option<&TaskOrder> {
        match &self.assignment {
            Assignment::Task(order) => Some(order),
            _ => None,
        }
    }
}

/// 发送失败，命令原样归还
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Mailbox full")]
    Full(Command),

    #[error("Mailbox closed: consumer is gone")]
    Closed(Command),
}

impl SendError {
    pub fn into_inner(self) -> Command {
        match self {
            SendError::Full(c) | SendError::Closed(c) => c,
        }
    }
}

/// 接收端错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("Mailbox closed: producer is gone")]
    Closed,
}

type Slot = Option<Command>;

/// 创建一个单槽邮箱，返回（生产者，消费者）
pub fn mailbox() -> (MailboxSender, MailboxReceiver) {
    let (tx, rx) = watch::channel::<Slot>(None);
    let slot = Arc::new(tx);
    (
        MailboxSender { slot: slot.clone() },
        MailboxReceiver { slot, rx },
    )
}

/// 生产者（仅 Dispatcher 持有，不可克隆）
#[derive(Debug)]
pub struct MailboxSender {
    slot: Arc<watch::Sender<Slot>>,
}

impl MailboxSender {
    /// 仅当槽位为空时写入
    pub fn try_send(&self, command: Command) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed(command));
        }
        let mut incoming = Some(command);
        self.slot.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = incoming.take();
                true
            } else {
                false
            }
        });
        match incoming {
            None => Ok(()),
            Some(command) => Err(SendError::Full(command)),
        }
    }

    /// 原子替换槽位内容，返回被丢弃的旧命令（若有）
    pub fn replace(&self, command: Command) -> Result<Option<Command>, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed(command));
        }
        Ok(self.slot.send_replace(Some(command)))
    }

    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_none()
    }

    /// 消费者已退出
    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }
}

/// 消费者（仅所属 Worker 持有）
#[derive(Debug)]
pub struct MailboxReceiver {
    slot: Arc<watch::Sender<Slot>>,
    rx: watch::Receiver<Slot>,
}

impl MailboxReceiver {
    /// 等待命令，超时返回 Ok(None)；生产者已退出且槽位为空时返回 Closed
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Command>, MailboxError> {
        let deadline = Instant::now() + timeout;
        loop {
            // 先标记已读再取，之后的写入一定会唤醒 changed()
            let _ = self.rx.borrow_and_update();
            if let Some(command) = self.take() {
                return Ok(Some(command));
            }
            if self.is_closed() {
                return Err(MailboxError::Closed);
            }
            match tokio::time::timeout_at(deadline, self.rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(MailboxError::Closed),
                Err(_) => return Ok(None),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_none()
    }

    /// 生产者已退出（只剩本端持有槽位）
    pub fn is_closed(&self) -> bool {
        Arc::strong_count(&self.slot) == 1
    }

    fn take(&self) -> Option<Command> {
        let mut taken = None;
        self.slot.send_if_modified(|slot| {
            taken = slot.take();
            taken.is_some()
        });
        taken
    }
}
