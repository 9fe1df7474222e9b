//! CLI 通用输出格式化模块

use anyhow::Result;
use colored::{ColoredString, Colorize};
use fleet_executor::{BatchReport, OperationStatus, ProgressEvent};
use serde::Serialize;

/// 可输出为表格行的数据 trait
pub trait TableRow {
    /// 返回表格列标题
    fn headers() -> Vec<&'static str>;

    /// 返回该项的表格行数据
    fn row(&self) -> Vec<String>;
}

/// 表格格式输出
pub fn print_table<T: TableRow>(items: &[T]) {
    let headers = T::headers();

    let header_line: String = headers
        .iter()
        .map(|h| format!("{:<18}", h))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{}", header_line.bold());
    println!("{}", "-".repeat(header_line.len()));

    for item in items {
        let row_line: String = item
            .row()
            .iter()
            .map(|c| format!("{:<18}", c))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{}", row_line);
    }
}

/// JSON 格式输出
pub fn print_json<T: Serialize>(items: &[T]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(items)?);
    Ok(())
}

/// 根据格式参数选择输出方式
pub fn output_formatted<T: TableRow + Serialize>(items: &[T], format: &str) -> Result<()> {
    match format {
        "json" => print_json(items),
        "table" => {
            print_table(items);
            Ok(())
        }
        other => anyhow::bail!("不支持的输出格式: {} (可选: table, json)", other),
    }
}

fn status_label(status: OperationStatus) -> ColoredString {
    match status {
        OperationStatus::Active => "执行中".yellow(),
        OperationStatus::Success => "✓ 成功".green().bold(),
        OperationStatus::Error => "✗ 失败".red().bold(),
        OperationStatus::Interrupted => "⏸ 中断".bright_black(),
    }
}

/// 打印进度事件
pub fn print_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::Status {
            vm,
            operation,
            status,
        } => {
            // 中断的操作在报告里统一展示
            if *status != OperationStatus::Interrupted {
                println!("  {:<20} {:<10} {}", vm.cyan(), operation, status_label(*status));
            }
        }
        ProgressEvent::CloneProgress { vm, percent } => {
            println!("  {:<20} {:<10} {}%", vm.cyan(), "clone", percent);
        }
    }
}

/// 拆分操作键 `{vm}_{operation}`（虚拟机名本身可能包含下划线）
fn split_key(key: &str) -> (&str, &str) {
    key.rsplit_once('_').unwrap_or((key, ""))
}

/// 打印批次报告
pub fn print_report(report: &BatchReport) {
    let summary = report.summary();

    println!();
    println!(
        "{} {}",
        "批次报告".bold(),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string().bright_black()
    );
    println!("{}", "=".repeat(60));
    println!("{:<24} {:<12} {}", "虚拟机".bold(), "操作".bold(), "状态".bold());
    println!("{}", "-".repeat(60));

    for (key, status) in &report.operation_results {
        let (vm, operation) = split_key(key);
        println!("{:<24} {:<12} {}", vm, operation, status_label(*status));
    }

    if !report.errors.is_empty() {
        println!();
        println!("{}", "错误:".red().bold());
        for message in &report.errors {
            println!("  {} {}", "•".red(), message);
        }
    }

    println!();
    let headline = format!(
        "共 {} 个操作: 成功 {}, 失败 {}, 中断 {}",
        summary.total, summary.success, summary.failed, summary.interrupted
    );
    if report.is_success() {
        println!("{} {}", "✓".green().bold(), headline);
    } else {
        println!("{} {}", "✗".red().bold(), headline);
        if !summary.failed_vms.is_empty() {
            println!("  失败的虚拟机: {}", summary.failed_vms.join(", ").red());
        }
    }
}
