//! Bee Copilot 命令行
//!
//! - `check <catalogue> <policy> <action> <args-json>`：以全新会话对拟执行操作求值策略，输出 JSON 结果
//! - `catalogue <catalogue>`：输出生成的操作 schema
//! - `replay <events.jsonl> [scope]`：回放事件并输出最终快照摘要

use std::path::Path;

use anyhow::{bail, Context};
use bee_copilot::{
    config::load_config,
    core::SessionState,
    observability,
    policy::{evaluate, ConstraintContext, PolicyDocument, PolicySettings},
    sync::{ApplyOutcome, ContextSynchronizer, EntityEvent},
    tools::{action_call_schema_json, ActionCatalogue, ActionFilter, CatalogueDocument},
};

const USAGE: &str = "usage:
  bee-copilot check <catalogue> <policy> <action> <args-json>
  bee-copilot catalogue <catalogue>
  bee-copilot replay <events.jsonl> [scope]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("check") if args.len() == 5 => check(&args[1], &args[2], &args[3], &args[4]),
        Some("catalogue") if args.len() == 2 => catalogue(&args[1]),
        Some("replay") if args.len() == 2 || args.len() == 3 => {
            replay(&args[1], args.get(2).map(String::as_str))
        }
        _ => bail!("{USAGE}"),
    }
}

fn load_catalogue(path: &str) -> anyhow::Result<ActionCatalogue> {
    let doc = CatalogueDocument::from_path(path)
        .with_context(|| format!("Failed to read catalogue {path}"))?;
    ActionCatalogue::generate(&doc).context("Failed to generate action catalogue")
}

fn check(catalogue_path: &str, policy_path: &str, action: &str, args_json: &str) -> anyhow::Result<()> {
    let cfg = load_config(None).context("Failed to load config")?;
    let catalogue = load_catalogue(catalogue_path)?;
    let policy = PolicyDocument::from_path(policy_path, PolicySettings::from(&cfg.policy))
        .with_context(|| format!("Failed to load policy {policy_path}"))?;
    let args: serde_json::Value =
        serde_json::from_str(args_json).context("Arguments are not valid JSON")?;
    let descriptor = catalogue
        .get(action)
        .with_context(|| format!("Unknown action: {action}"))?;

    let session = SessionState::default();
    let result = evaluate(&policy, &ConstraintContext::new(descriptor, &session, &args));
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn catalogue(path: &str) -> anyhow::Result<()> {
    let catalogue = load_catalogue(path)?;
    println!("{}", catalogue.to_schema_json(&ActionFilter::all()));
    println!("{}", action_call_schema_json());
    Ok(())
}

fn replay(path: &str, scope: Option<&str>) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("Failed to read events {path}"))?;
    let mut events = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: EntityEvent = serde_json::from_str(line)
            .with_context(|| format!("Invalid event on line {}", n + 1))?;
        events.push(event);
    }

    let scope_id = match scope {
        Some(s) => s.to_string(),
        None => match events.first() {
            Some(e) => e.scope_id.clone(),
            None => bail!("No events in {path} and no scope given"),
        },
    };

    let cfg = load_config(None).context("Failed to load config")?;
    let mut sync = ContextSynchronizer::new(scope_id, cfg.sync.dedup_capacity);
    let (mut applied, mut duplicates, mut foreign) = (0usize, 0usize, 0usize);
    for event in &events {
        match sync.apply_event(event) {
            ApplyOutcome::Applied => applied += 1,
            ApplyOutcome::Duplicate => duplicates += 1,
            ApplyOutcome::ForeignScope => foreign += 1,
        }
    }

    let report = serde_json::json!({
        "applied": applied,
        "duplicates": duplicates,
        "foreign_scope": foreign,
        "snapshot": sync.snapshot().summary(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
