//! 虚拟化异步任务
//!
//! 长耗时操作（开关机、快照、重配置、克隆）提交后返回一个 [`Task`] 句柄，
//! 调用方通过轮询 [`Task::info`] 观察其状态与进度。

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Result, VmRef};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// 已提交，尚未开始
    Queued,
    /// 执行中
    Running,
    /// 成功
    Success,
    /// 失败
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// 任务失败信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFault {
    /// 本地化错误信息
    pub localized_message: Option<String>,
    /// 原始错误描述
    pub detail: String,
}

impl TaskFault {
    pub fn new(detail: &str) -> Self {
        Self {
            localized_message: None,
            detail: detail.to_string(),
        }
    }

    pub fn with_localized(mut self, message: &str) -> Self {
        self.localized_message = Some(message.to_string());
        self
    }

    /// 优先使用本地化信息，缺省时退回原始描述
    pub fn message(&self) -> &str {
        self.localized_message.as_deref().unwrap_or(&self.detail)
    }
}

impl std::fmt::Display for TaskFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// 任务快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub state: TaskState,
    /// 进度百分比（后端不一定提供）
    pub progress: Option<u8>,
    /// 任务结果（克隆任务返回新虚拟机）
    pub result: Option<VmRef>,
    pub error: Option<TaskFault>,
}

impl TaskInfo {
    pub fn queued() -> Self {
        Self {
            state: TaskState::Queued,
            progress: None,
            result: None,
            error: None,
        }
    }
}

/// 异步任务句柄
pub trait Task: Send + Sync {
    /// 读取任务当前状态
    fn info(&self) -> TaskInfo;
}

// ============================================
// 后台任务实现
// ============================================

/// 进度上报句柄
#[derive(Clone)]
pub struct ProgressHandle {
    info: Arc<Mutex<TaskInfo>>,
}

impl ProgressHandle {
    /// 更新进度百分比（超过 100 的值按 100 处理）
    pub fn set(&self, percent: u8) {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        info.progress = Some(percent.min(100));
    }
}

/// 由 tokio 后台任务驱动的 [`Task`]
///
/// libvirt 的大部分操作是同步调用，这里把它们放到后台执行，
/// 对外表现为与其他虚拟化平台一致的可轮询任务。
pub struct BackgroundTask {
    description: String,
    info: Arc<Mutex<TaskInfo>>,
}

impl BackgroundTask {
    /// 启动后台任务
    pub fn spawn<F, Fut>(description: &str, work: F) -> Self
    where
        F: FnOnce(ProgressHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<VmRef>>> + Send + 'static,
    {
        let info = Arc::new(Mutex::new(TaskInfo::queued()));
        let progress = ProgressHandle {
            info: Arc::clone(&info),
        };
        let shared = Arc::clone(&info);
        let desc = description.to_string();

        tokio::spawn(async move {
            set_state(&shared, TaskState::Running);
            debug!("任务开始: {}", desc);

            let outcome = work(progress).await;

            let mut info = shared.lock().unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Ok(result) => {
                    info.state = TaskState::Success;
                    info.progress = Some(100);
                    info.result = result;
                    debug!("任务完成: {}", desc);
                }
                Err(e) => {
                    info.state = TaskState::Error;
                    info.error = Some(TaskFault::new(&e.to_string()));
                    debug!("任务失败: {} - {}", desc, e);
                }
            }
        });

        Self {
            description: description.to_string(),
            info,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl Task for BackgroundTask {
    fn info(&self) -> TaskInfo {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn set_state(info: &Mutex<TaskInfo>, state: TaskState) {
    info.lock().unwrap_or_else(PoisonError::into_inner).state = state;
}
