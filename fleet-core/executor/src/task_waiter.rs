//! 任务等待
//!
//! 固定间隔轮询任务句柄直到终态。提交后先等待一个很短的宽限期，
//! 避免在任务离开排队状态前读取。

use std::time::Duration;

use fleet_transport::{Task, TaskState, VmRef};
use tracing::debug;

use crate::{ExecutorError, ExecutorSettings, Result};

/// 等待任务完成，返回任务结果
pub async fn wait_for_task(
    task: &dyn Task,
    description: &str,
    settings: &ExecutorSettings,
) -> Result<Option<VmRef>> {
    wait_for_task_with(task, description, settings, |_| {}).await
}

/// 等待任务完成，每次轮询把进度交给回调
pub async fn wait_for_task_with<F>(
    task: &dyn Task,
    description: &str,
    settings: &ExecutorSettings,
    on_poll: F,
) -> Result<Option<VmRef>>
where
    F: FnMut(Option<u8>),
{
    wait_for_task_every(task, description, settings, settings.task_poll(), on_poll).await
}

/// 以指定间隔轮询任务
pub async fn wait_for_task_every<F>(
    task: &dyn Task,
    description: &str,
    settings: &ExecutorSettings,
    interval: Duration,
    mut on_poll: F,
) -> Result<Option<VmRef>>
where
    F: FnMut(Option<u8>),
{
    tokio::time::sleep(settings.task_grace()).await;

    loop {
        let info = task.info();
        on_poll(info.progress);

        match info.state {
            TaskState::Success => {
                debug!("✅ {} 完成", description);
                return Ok(info.result);
            }
            TaskState::Error => {
                let message = info
                    .error
                    .map(|fault| fault.message().to_string())
                    .unwrap_or_else(|| "未知错误".to_string());
                return Err(ExecutorError::operation_failed(description, message));
            }
            TaskState::Queued | TaskState::Running => {
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_transport::{TaskFault, TaskInfo};
    use std::sync::Mutex;

    /// 按脚本依次返回状态的任务
    struct ScriptedTask {
        states: Mutex<Vec<TaskInfo>>,
    }

    impl ScriptedTask {
        fn new(mut states: Vec<TaskInfo>) -> Self {
            states.reverse();
            Self {
                states: Mutex::new(states),
            }
        }
    }

    impl Task for ScriptedTask {
        fn info(&self) -> TaskInfo {
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                states.pop().unwrap()
            } else {
                states[0].clone()
            }
        }
    }

    fn running(progress: Option<u8>) -> TaskInfo {
        TaskInfo {
            state: TaskState::Running,
            progress,
            ..TaskInfo::queued()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_result() {
        let task = ScriptedTask::new(vec![
            TaskInfo::queued(),
            running(Some(50)),
            TaskInfo {
                state: TaskState::Success,
                result: Some(VmRef::new("clone-01", "id-1")),
                ..TaskInfo::queued()
            },
        ]);

        let mut seen = Vec::new();
        let result = wait_for_task_with(&task, "克隆", &ExecutorSettings::default(), |p| {
            seen.push(p)
        })
        .await
        .unwrap();

        assert_eq!(result.unwrap().name, "clone-01");
        assert_eq!(seen, vec![None, Some(50), None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_prefers_localized_message() {
        let task = ScriptedTask::new(vec![TaskInfo {
            state: TaskState::Error,
            error: Some(TaskFault::new("raw fault").with_localized("数据存储空间不足")),
            ..TaskInfo::queued()
        }]);

        let err = wait_for_task(&task, "克隆虚拟机", &ExecutorSettings::default())
            .await
            .unwrap_err();
        match err {
            ExecutorError::OperationFailed {
                description,
                message,
            } => {
                assert_eq!(description, "克隆虚拟机");
                assert_eq!(message, "数据存储空间不足");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_localized_uses_detail() {
        let task = ScriptedTask::new(vec![TaskInfo {
            state: TaskState::Error,
            error: Some(TaskFault::new("InvalidState")),
            ..TaskInfo::queued()
        }]);

        let err = wait_for_task(&task, "开机", &ExecutorSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "开机失败: InvalidState");
    }
}
