use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde_json::json;
use shadow_core::VersionId;
use shadow_engine::telemetry::{self, LogFormat};
use shadow_engine::{CalibrationJob, EngineSettings, JudgmentAdapter, RuleBasedJudge, StateLayout};

fn state_dir_arg() -> Arg {
    Arg::new("state-dir")
        .long("state-dir")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Directory holding the engine journals")
}

fn cli() -> Command {
    Command::new("shadow-engine")
        .version(shadow_engine::VERSION)
        .about("Inspect and operate a shadow engine state directory")
        .subcommand_required(true)
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log output encoding"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .help("Log filter when RUST_LOG is unset"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine settings file (TOML, YAML or JSON)"),
        )
        .subcommand(
            Command::new("verify")
                .about("Verify golden trace integrity")
                .arg(state_dir_arg()),
        )
        .subcommand(
            Command::new("history")
                .about("List golden trace entries")
                .arg(state_dir_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON lines"),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(value_parser!(usize))
                        .help("Only the most recent N entries"),
                ),
        )
        .subcommand(
            Command::new("versions")
                .about("List configuration versions and the live pointer")
                .arg(state_dir_arg()),
        )
        .subcommand(
            Command::new("rollback")
                .about("Move the live pointer to a recorded version")
                .arg(state_dir_arg())
                .arg(
                    Arg::new("version")
                        .long("version")
                        .required(true)
                        .value_parser(value_parser!(u64))
                        .help("Target version id"),
                ),
        )
        .subcommand(
            Command::new("queue")
                .about("List evolutionary queue candidates")
                .arg(state_dir_arg()),
        )
        .subcommand(
            Command::new("calibrate")
                .about("Replay recent decisions through the rule-based judge")
                .arg(state_dir_arg()),
        )
}

fn load_settings(matches: &ArgMatches) -> anyhow::Result<EngineSettings> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineSettings::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineSettings::default()),
    }
}

fn layout(args: &ArgMatches) -> anyhow::Result<StateLayout> {
    let dir = args
        .get_one::<PathBuf>("state-dir")
        .context("--state-dir is required")?;
    let layout = StateLayout::new(dir);
    if layout.is_empty() {
        bail!("no engine state under {}", dir.display());
    }
    Ok(layout)
}

fn verify(args: &ArgMatches) -> anyhow::Result<()> {
    let golden = layout(args)?.open_golden_trace()?;
    golden.verify_integrity().context("golden trace integrity check failed")?;
    println!("golden trace OK: {} entries, {} final verdicts", golden.len(), golden.final_count());
    Ok(())
}

fn history(args: &ArgMatches) -> anyhow::Result<()> {
    let golden = layout(args)?.open_golden_trace()?;
    let entries = match args.get_one::<usize>("limit") {
        Some(limit) => golden.tail(*limit),
        None => golden.entries(),
    };
    if args.get_flag("json") {
        for entry in &entries {
            println!("{}", serde_json::to_string(entry)?);
        }
        return Ok(());
    }
    for e in &entries {
        println!(
            "#{:<5} {} {:<10} {:<8} div={:.4} {} -> {} by {:?}  {}",
            e.sequence,
            e.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            e.scope.to_string(),
            e.kind().to_string(),
            e.divergence(),
            e.version_before,
            e.version_after,
            e.resolved_by,
            e.proposal_id,
        );
    }
    Ok(())
}

fn versions(args: &ArgMatches) -> anyhow::Result<()> {
    let store = layout(args)?.open_versions(json!({}))?;
    let live = store.live_version();
    for config in store.versions() {
        let marker = if config.version() == live { "*" } else { " " };
        let parent = config.parent().map_or_else(|| "-".to_string(), |p| p.to_string());
        let origin = config.origin().map_or_else(|| "-".to_string(), |o| o.to_string());
        println!(
            "{marker} {:<6} {} parent={parent} origin={origin} {}",
            config.version(),
            config.hash().short(),
            config.created_at().format("%Y-%m-%dT%H:%M:%SZ"),
        );
    }
    for moved in store.pointer_history() {
        println!("  moved {} -> {} ({:?}) at {}", moved.from, moved.to, moved.reason, moved.at);
    }
    Ok(())
}

fn rollback(args: &ArgMatches) -> anyhow::Result<()> {
    let version = VersionId(*args.get_one::<u64>("version").context("--version is required")?);
    let store = layout(args)?.open_versions(json!({}))?;
    match store.set_live(version)? {
        Some(moved) => println!("live configuration moved {} -> {}", moved.from, moved.to),
        None => println!("{version} is already live"),
    }
    Ok(())
}

fn queue(args: &ArgMatches, settings: &EngineSettings) -> anyhow::Result<()> {
    let queue = layout(args)?.open_queue(settings.evolution.capacity)?;
    let info = queue.info();
    println!(
        "generation {} | evaluated {} approved {} rejected {} | depth {}/{}",
        info.generation,
        info.total_evaluated,
        info.total_approved,
        info.total_rejected,
        info.queue_depth,
        info.capacity,
    );
    for c in queue.candidates() {
        println!(
            "  [{}] gen {} {} parent={} {}",
            c.id, c.generation, c.draft.scope, c.parent, c.draft.description
        );
    }
    Ok(())
}

async fn calibrate(args: &ArgMatches, settings: &EngineSettings) -> anyhow::Result<()> {
    let golden = layout(args)?.open_golden_trace()?;
    let judge = Arc::new(RuleBasedJudge::new(settings.rule_judge.clone()));
    let job = CalibrationJob::new(
        JudgmentAdapter::new(judge, settings.judgment.clone()),
        settings.scopes.clone(),
        settings.max_extensions,
        settings.calibration.clone(),
    );
    let report = job.run(&golden.entries()).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.healthy {
        std::process::exit(2);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let format: LogFormat = matches
        .get_one::<String>("log-format")
        .map_or(Ok(LogFormat::Text), |s| s.parse())
        .map_err(anyhow::Error::msg)?;
    let level = matches
        .get_one::<String>("log-level")
        .map_or("info", String::as_str);
    telemetry::init(level, format)?;

    let settings = load_settings(&matches)?;

    match matches.subcommand() {
        Some(("verify", args)) => verify(args),
        Some(("history", args)) => history(args),
        Some(("versions", args)) => versions(args),
        Some(("rollback", args)) => rollback(args),
        Some(("queue", args)) => queue(args, &settings),
        Some(("calibrate", args)) => calibrate(args, &settings).await,
        _ => unreachable!("subcommand_required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn rollback_requires_version() {
        let result = cli().try_get_matches_from(["shadow-engine", "rollback", "--state-dir", "/tmp/x"]);
        assert!(result.is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let m = cli()
            .try_get_matches_from(["shadow-engine", "history", "--state-dir", "/tmp/x", "--log-format", "json", "--limit", "5"])
            .unwrap();
        assert_eq!(m.get_one::<String>("log-format").map(String::as_str), Some("json"));
        let (_, sub) = m.subcommand().unwrap();
        assert_eq!(sub.get_one::<usize>("limit"), Some(&5));
    }
}
