//! WebPilot Run - 在终端执行单个任务
//!
//! 运行方式：
//! ```bash
//! cargo run --bin webpilot-run -- "navigate to example.com and read the heading"
//! cargo run --bin webpilot-run --features browser -- --config my.toml "..."
//! ```
//!
//! 进度打印到标准输出；Ctrl+C 取消任务。

use std::path::PathBuf;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use webpilot::config::load_config;
use webpilot::core::TaskCallback;
use webpilot::gateway::MessageType;
use webpilot::{build_execution_loop, TaskOutcome};

/// 把进度打印到终端
struct ConsoleCallback;

impl TaskCallback for ConsoleCallback {
    fn send(&self, message: MessageType) {
        match message {
            MessageType::StatusUpdate { message } => println!("  {}", message),
            MessageType::TaskError { error } => eprintln!("error: {}", error),
            _ => {}
        }
    }
}

fn parse_args() -> anyhow::Result<(Option<PathBuf>, String)> {
    let mut config_path = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config needs a path")?;
            config_path = Some(PathBuf::from(path));
        } else {
            words.push(arg);
        }
    }
    let task = words.join(" ");
    if task.trim().is_empty() {
        bail!("usage: webpilot-run [--config <file>] <task>");
    }
    Ok((config_path, task))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    webpilot::observability::init();

    let (config_path, task) = parse_args()?;
    let cfg = load_config(config_path).context("Failed to load config")?;
    let executor = build_execution_loop(&cfg).context("Failed to configure LLM providers")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let task_id = uuid::Uuid::new_v4().to_string();
    println!("Task {}: {}", task_id, task);
    let result = executor.run(&task_id, &task, &ConsoleCallback, &cancel).await;

    println!();
    println!("Outcome: {:?} (success: {})", result.outcome, result.success);
    if let Some(confidence) = result.confidence {
        println!("Confidence: {:.2}", confidence);
    }
    println!("Steps: {}", result.steps);
    println!("Result: {}", result.message);

    if result.outcome == TaskOutcome::Error {
        std::process::exit(1);
    }
    Ok(())
}
