use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio_stream::StreamExt;
use tracing::info;

use notebook_pollers::cli::{resolve_config, Args, Command};
use notebook_pollers::trace_view::{build_steps, message_create_time};
use notebook_pollers::{
    final_answer_absent, AgentApi, AgentMessage, HttpAgentApi, MemoryPoller, MemorySetup,
    MemoryTarget, MessagePoller, MessageSetup, PollerConfig, TraceAccumulator, TraceBody,
    TraceStep, TraceTarget,
};

const INTERRUPTED: &str = "Interrupted";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = resolve_config(&args)?;
    let api: Arc<dyn AgentApi> = Arc::new(HttpAgentApi::from_config(&cfg));
    info!(base_url = %cfg.base_url, data_source_id = ?cfg.data_source_id, "connecting");

    match args.command {
        Command::Message {
            container,
            message_id,
        } => run_message(api, &cfg, container, message_id).await,
        Command::Memory {
            container,
            executor,
            follow_message,
        } => run_memory(api, &cfg, container, executor, follow_message).await,
        Command::Trace {
            container,
            executor,
            message_id,
            parent_message,
        } => run_trace(api, &cfg, container, executor, message_id, parent_message).await,
    }
    Ok(())
}

fn message_poller(
    api: &Arc<dyn AgentApi>,
    cfg: &PollerConfig,
    container: &str,
    message_id: &str,
) -> Arc<MessagePoller> {
    let poller = Arc::new(
        MessagePoller::new(Arc::clone(api), container).with_interval(cfg.message_interval()),
    );
    poller.setup(MessageSetup {
        message_id: message_id.to_string(),
        data_source_id: cfg.data_source_id.clone(),
    });
    poller
}

/// Memory poller that runs while `parent` has no final answer, or until
/// interrupted when there is no parent.
fn memory_poller(
    api: &Arc<dyn AgentApi>,
    cfg: &PollerConfig,
    container: &str,
    executor: &str,
    parent: Option<&MessagePoller>,
) -> MemoryPoller {
    let target = MemoryTarget {
        memory_container_id: container.to_string(),
        executor_memory_id: executor.to_string(),
    };
    let poller = match parent.map(MessagePoller::subscribe) {
        Some(rx) => MemoryPoller::new(Arc::clone(api), target, move || {
            final_answer_absent(rx.borrow().as_ref())
        }),
        None => MemoryPoller::new(Arc::clone(api), target, || true),
    }
    .with_interval(cfg.memory_interval());
    poller.setup(MemorySetup {
        data_source_id: cfg.data_source_id.clone(),
    });
    poller
}

async fn run_message(
    api: Arc<dyn AgentApi>,
    cfg: &PollerConfig,
    container: String,
    message_id: String,
) {
    let poller = message_poller(&api, cfg, &container, &message_id);
    let mut updates = poller.message_stream();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                poller.stop(INTERRUPTED);
                break;
            }
            update = updates.next() => {
                let Some(Some(resp)) = update else { continue };
                match resp.final_response() {
                    Some(answer) => {
                        println!("{}", "Final answer".green().bold());
                        println!("{answer}");
                        break;
                    }
                    None => println!("{}", format!("{message_id}: still running").dimmed()),
                }
            }
        }
    }
}

async fn run_memory(
    api: Arc<dyn AgentApi>,
    cfg: &PollerConfig,
    container: String,
    executor: String,
    follow: Option<String>,
) {
    let parent = follow
        .as_deref()
        .map(|id| message_poller(&api, cfg, &container, id));
    let poller = memory_poller(&api, cfg, &container, &executor, parent.as_deref());
    let mut updates = poller.messages_stream();
    let mut polling = poller.subscribe_polling_state();
    let mut shown: Vec<AgentMessage> = Vec::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                poller.stop(INTERRUPTED);
                break;
            }
            _ = polling.wait_for(|p| !*p) => {
                print_messages(&mut shown, &poller.messages_value());
                break;
            }
            Some(list) = updates.next() => print_messages(&mut shown, &list),
        }
    }
    if let Some(parent) = parent {
        parent.stop(INTERRUPTED);
    }
}

fn print_messages(shown: &mut Vec<AgentMessage>, list: &[AgentMessage]) {
    for (i, msg) in list.iter().enumerate() {
        if shown.get(i) == Some(msg) {
            continue;
        }
        let status = if msg.has_response() {
            "done".green()
        } else {
            "running".yellow()
        };
        println!("{} {} [{}]", format!("#{}", i + 1).bold(), msg.message_id.cyan(), status);
        if let Some(input) = &msg.input {
            println!("  {}", input.dimmed());
        }
        if let Some(response) = msg.response.as_deref().filter(|r| !r.is_empty()) {
            println!("  {response}");
        }
    }
    *shown = list.to_vec();
}

async fn run_trace(
    api: Arc<dyn AgentApi>,
    cfg: &PollerConfig,
    container: String,
    executor: String,
    message_id: String,
    parent_message: Option<String>,
) {
    let parent = parent_message
        .as_deref()
        .map(|id| message_poller(&api, cfg, &container, id));
    let memory = memory_poller(&api, cfg, &container, &executor, parent.as_deref());

    let top_rx = match &parent {
        Some(p) => p.subscribe(),
        None => tokio::sync::watch::channel(None).1,
    };
    let acc = TraceAccumulator::new(Arc::clone(&api), top_rx, memory.subscribe_messages())
        .with_interval(cfg.trace_interval());
    acc.open(TraceTarget {
        message_id: message_id.clone(),
        memory_container_id: container,
        executor_memory_id: executor,
        data_source_id: cfg.data_source_id.clone(),
    });

    let mut updates = acc.traces_stream();
    let mut loading = acc.subscribe_loading();
    let mut printed = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                acc.close(INTERRUPTED);
                break;
            }
            _ = loading.wait_for(|l| !*l) => {
                printed = print_steps(printed, &acc.traces_value(), &memory, &message_id);
                println!("{}", format!("{message_id}: {printed} steps, complete").green());
                break;
            }
            Some(traces) = updates.next() => {
                printed = print_steps(printed, &traces, &memory, &message_id);
            }
        }
    }
    memory.stop(INTERRUPTED);
    if let Some(parent) = parent {
        parent.stop(INTERRUPTED);
    }
}

fn print_steps(
    printed: usize,
    traces: &[notebook_pollers::TraceRecord],
    memory: &MemoryPoller,
    message_id: &str,
) -> usize {
    let executor_messages = memory.messages_value();
    let steps = build_steps(traces, message_create_time(&executor_messages, message_id));
    for step in steps.iter().skip(printed) {
        print_step(step);
    }
    steps.len().max(printed)
}

fn print_step(step: &TraceStep) {
    let title = if step.from_llm {
        step.title.magenta().bold()
    } else {
        step.title.cyan().bold()
    };
    println!("{title}");
    for section in &step.sections {
        println!("  {}", section.label.yellow());
        let body = match &section.body {
            TraceBody::Missing(text) => text.dimmed().to_string(),
            other => other.as_text().to_string(),
        };
        for line in body.lines() {
            println!("    {line}");
        }
    }
}
