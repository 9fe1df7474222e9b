//! 批次报告

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::operation::operation_key;
use crate::{ExecutorError, Result};

/// 单个操作的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Active,
    Success,
    Error,
    /// 因取消而未执行
    Interrupted,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Active => "active",
            Self::Success => "success",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
        };
        write!(f, "{}", text)
    }
}

/// 批次执行报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// 提交的操作总数
    pub total_operations: usize,
    pub success_count: usize,
    /// 全部错误（按发生顺序）
    pub errors: Vec<String>,
    /// 按虚拟机归集的错误
    pub vm_errors: BTreeMap<String, Vec<String>>,
    /// 操作键 -> 状态
    #[serde(rename = "operationResults")]
    pub operation_results: BTreeMap<String, OperationStatus>,
}

/// 报告摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub interrupted: usize,
    /// 至少有一个错误的虚拟机
    pub failed_vms: Vec<String>,
}

impl BatchReport {
    pub fn new(total_operations: usize) -> Self {
        Self {
            total_operations,
            ..Self::default()
        }
    }

    pub fn record_active(&mut self, vm: &str, operation: &str) {
        self.set(vm, operation, OperationStatus::Active);
    }

    pub fn record_success(&mut self, vm: &str, operation: &str) {
        self.success_count += 1;
        self.set(vm, operation, OperationStatus::Success);
    }

    /// 记录失败：同时进入总错误列表与该虚拟机的错误列表
    pub fn record_error(&mut self, vm: &str, operation: &str, message: String) {
        self.set(vm, operation, OperationStatus::Error);
        self.vm_errors
            .entry(vm.to_string())
            .or_default()
            .push(message.clone());
        self.errors.push(message);
    }

    pub fn record_interrupted(&mut self, vm: &str, operation: &str) {
        self.set(vm, operation, OperationStatus::Interrupted);
    }

    /// 批次级消息（不属于某台虚拟机）
    pub fn push_error(&mut self, message: String) {
        self.errors.push(message);
    }

    pub fn status(&self, vm: &str, operation: &str) -> Option<OperationStatus> {
        self.operation_results
            .get(&operation_key(vm, operation))
            .copied()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.success_count == self.total_operations
    }

    pub fn summary(&self) -> BatchSummary {
        let count = |status: OperationStatus| {
            self.operation_results
                .values()
                .filter(|s| **s == status)
                .count()
        };

        BatchSummary {
            total: self.total_operations,
            success: self.success_count,
            failed: count(OperationStatus::Error),
            interrupted: count(OperationStatus::Interrupted),
            failed_vms: self.vm_errors.keys().cloned().collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    fn set(&mut self, vm: &str, operation: &str, status: OperationStatus) {
        self.operation_results
            .insert(operation_key(vm, operation), status);
    }
}
