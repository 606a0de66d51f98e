//! ST-013: CLI subcommands — print, validate, deploy, update, build, diff, undeploy.

use crate::cloud::images::ImageStore;
use crate::cloud::reconciler::Reconciler;
use crate::cloud::{connect, sim::SimCloud, Pacer};
use crate::core::deploy::{plan_launch, Deployer};
use crate::core::error::{Error, Result};
use crate::core::orchestrator::Orchestrator;
use crate::core::parser::{self, ProjectConfig};
use crate::core::registry::{DeclaredStack, Environment, StackRegistry};
use crate::core::resolver::resolve;
use crate::core::template::BuiltinTemplates;
use crate::core::types::{Purpose, ADMISSION_CAP};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum interval between remote calls during a build run, to stay under
/// provider throttling.
const BUILD_CALL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate stratus.yaml without connecting to the cloud
    Validate {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,
    },

    /// Show how each launchable would come up right now
    Print {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Limit to one stack
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// Create declared stacks (all of them when none are named)
    Deploy {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Stacks to deploy; empty means every declared stack
        stacks: Vec<String>,

        /// Show what would be created without creating it
        #[arg(long)]
        dry_run: bool,
    },

    /// Update already-deployed stacks in place
    Update {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Stacks to update; empty means every declared stack
        stacks: Vec<String>,

        /// Show what would change without changing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Bake missing images for buildable launchables
    Build {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Limit to one stack
        #[arg(short, long)]
        stack: Option<String>,

        /// Build only the next phase increment instead of the full prefix
        #[arg(long)]
        next_only: bool,

        /// Show build targets without launching anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Structural diff between the local definition and the deployed template
    Diff {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Stack to diff
        stack: String,
    },

    /// Tear deployed stacks down
    Undeploy {
        /// Path to stratus.yaml
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Stacks to delete; empty means every declared stack
        stacks: Vec<String>,

        /// Show what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Print { file, stack } => cmd_print(&file, stack.as_deref()),
        Commands::Deploy {
            file,
            stacks,
            dry_run,
        } => cmd_deploy(&file, &stacks, false, dry_run),
        Commands::Update {
            file,
            stacks,
            dry_run,
        } => cmd_deploy(&file, &stacks, true, dry_run),
        Commands::Build {
            file,
            stack,
            next_only,
            dry_run,
        } => cmd_build(&file, stack.as_deref(), next_only, dry_run),
        Commands::Diff { file, stack } => cmd_diff(&file, &stack),
        Commands::Undeploy {
            file,
            stacks,
            dry_run,
        } => cmd_undeploy(&file, &stacks, dry_run),
    }
}

/// Parse and validate; validation failures are printed and fatal.
fn parse_and_validate(file: &Path) -> Result<ProjectConfig> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(Error::Config(format!("{} validation error(s)", errors.len())))
}

/// Build the stack registry and variable environment from a config.
fn registry_from(config: &ProjectConfig) -> (StackRegistry, Environment) {
    let mut registry = StackRegistry::new();
    for (name, decl) in &config.stacks {
        registry.register(name, Box::new(DeclaredStack::new(decl.launchables.clone())));
    }
    let mut environment = Environment::new(config.params.clone());
    for (var, values) in &config.vars {
        environment.set_stack_var(var, values.clone());
    }
    (registry, environment)
}

/// Stack names to operate on: one when filtered, otherwise all, in
/// declaration order.
fn selected_stacks<'a>(registry: &'a StackRegistry, filter: Option<&str>) -> Result<Vec<&'a str>> {
    match filter {
        Some(name) => {
            if !registry.contains(name) {
                return Err(Error::Config(format!("unknown stack: {}", name)));
            }
            Ok(registry.names().into_iter().filter(|n| *n == name).collect())
        }
        None => Ok(registry.names()),
    }
}

/// Stack names to operate on: the requested ones in the given order, or
/// every declared stack when none are named.
fn selected_many<'a>(registry: &'a StackRegistry, requested: &'a [String]) -> Result<Vec<&'a str>> {
    if requested.is_empty() {
        return Ok(registry.names());
    }
    let mut out = Vec::with_capacity(requested.len());
    for name in requested {
        if !registry.contains(name) {
            return Err(Error::Config(format!("unknown stack: {}", name)));
        }
        out.push(name.as_str());
    }
    Ok(out)
}

fn provider_for(config: &ProjectConfig) -> Result<SimCloud> {
    connect(&config.target)
}

fn cmd_validate(file: &Path) -> Result<()> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        let launchables: usize = config
            .stacks
            .values()
            .map(|s| s.launchables.len())
            .sum();
        println!(
            "OK: {} ({} stacks, {} launchables)",
            config.name,
            config.stacks.len(),
            launchables
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(Error::Config(format!("{} validation error(s)", errors.len())))
    }
}

fn cmd_print(file: &Path, stack_filter: Option<&str>) -> Result<()> {
    let config = parse_and_validate(file)?;
    let (registry, environment) = registry_from(&config);
    let provider = provider_for(&config)?;
    let images = ImageStore::new(&provider);
    let deployer = Deployer::new(
        Reconciler::new(&provider, &config.target.template_store_or(&config.name)),
        ImageStore::new(&provider),
        BuiltinTemplates,
        &config.name,
    );

    for stack in selected_stacks(&registry, stack_filter)? {
        let launchables = registry.construct(stack, &environment)?;
        println!("{}:", stack);
        for spec in plan_launch(&launchables, &config.target.region, &images)? {
            println!(
                "  {} image={} baked={} at-launch={}",
                spec.launchable,
                spec.image,
                spec.covered,
                spec.at_launch.len()
            );
            for phase in &spec.at_launch {
                println!("    - {}", phase.name);
            }
        }
        let definition = deployer.definition(stack, &launchables, &config.target.region)?;
        println!("{}", definition.render_json()?);
    }
    Ok(())
}

fn cmd_deploy(file: &Path, stacks: &[String], allow_update: bool, dry_run: bool) -> Result<()> {
    let config = parse_and_validate(file)?;
    let (registry, environment) = registry_from(&config);
    let provider = provider_for(&config)?;
    let deployer = Deployer::new(
        Reconciler::new(&provider, &config.target.template_store_or(&config.name)),
        ImageStore::new(&provider),
        BuiltinTemplates,
        &config.name,
    );

    for stack in selected_many(&registry, stacks)? {
        let launchables = registry.construct(stack, &environment)?;

        if dry_run {
            let definition = deployer.definition(stack, &launchables, &config.target.region)?;
            println!("{}", definition.render_json()?);
            continue;
        }

        let handle = deployer.deploy(stack, &launchables, &config.target.region, allow_update)?;
        println!(
            "{}: {} ({})",
            stack,
            if allow_update { "updated" } else { "created" },
            handle.id
        );
    }
    if dry_run {
        println!("Dry run — no changes applied.");
    }
    Ok(())
}

fn cmd_build(
    file: &Path,
    stack_filter: Option<&str>,
    next_only: bool,
    dry_run: bool,
) -> Result<()> {
    let config = parse_and_validate(file)?;
    let (registry, environment) = registry_from(&config);
    let provider = provider_for(&config)?;

    let mut orchestrator = Orchestrator::new(
        Reconciler::new(&provider, &config.target.template_store_or(&config.name)),
        ImageStore::new(&provider),
        BuiltinTemplates,
        &config.name,
        ADMISSION_CAP,
    );

    let images = ImageStore::new(&provider);
    let mut queued = 0usize;
    for stack in selected_stacks(&registry, stack_filter)? {
        let launchables = registry.construct(stack, &environment)?;
        for (name, launchable) in &launchables {
            let candidates = resolve(
                name,
                launchable,
                &config.target.region,
                Purpose::Build { next_only },
                &images,
            )?;
            for candidate in candidates {
                let target = candidate.target_id.clone().unwrap_or_default();
                let phases = candidate.remaining.len();
                if dry_run {
                    println!("{}/{}: would build {} ({} phases)", stack, name, target, phases);
                    queued += 1;
                } else if orchestrator.enqueue(name, launchable, candidate)? {
                    queued += 1;
                }
            }
        }
    }

    if dry_run {
        println!("Dry run — {} target(s), nothing launched.", queued);
        return Ok(());
    }
    if queued == 0 {
        println!("Nothing to build — all images are current.");
        return Ok(());
    }

    let summary = orchestrator.run(&mut Pacer::new(BUILD_CALL_INTERVAL))?;
    for report in &summary.reports {
        match report.image_id {
            Some(ref image) => {
                println!("{}: {} {} ({})", report.launchable, report.target_id, report.outcome, image)
            }
            None => println!("{}: {} {}", report.launchable, report.target_id, report.outcome),
        }
    }
    println!(
        "Build: {} succeeded, {} failed.",
        summary.succeeded(),
        summary.failed()
    );

    if summary.all_ok() {
        Ok(())
    } else {
        Err(Error::Remote(format!(
            "{} build target(s) failed",
            summary.failed()
        )))
    }
}

fn cmd_diff(file: &Path, stack: &str) -> Result<()> {
    let config = parse_and_validate(file)?;
    let (registry, environment) = registry_from(&config);
    if !registry.contains(stack) {
        return Err(Error::Config(format!("unknown stack: {}", stack)));
    }
    let launchables = registry.construct(stack, &environment)?;

    let provider = provider_for(&config)?;
    let reconciler = Reconciler::new(&provider, &config.target.template_store_or(&config.name));
    let deployer = Deployer::new(
        Reconciler::new(&provider, &config.target.template_store_or(&config.name)),
        ImageStore::new(&provider),
        BuiltinTemplates,
        &config.name,
    );

    let definition = deployer.definition(stack, &launchables, &config.target.region)?;
    let entries = reconciler.diff(&definition, stack)?;
    if entries.is_empty() {
        println!("{}: no changes.", stack);
    } else {
        for entry in &entries {
            println!("  {}", entry);
        }
        println!("{}: {} change(s).", stack, entries.len());
    }
    Ok(())
}

fn cmd_undeploy(file: &Path, stacks: &[String], dry_run: bool) -> Result<()> {
    let config = parse_and_validate(file)?;
    let (registry, _) = registry_from(&config);
    let selected = selected_many(&registry, stacks)?;

    if dry_run {
        for stack in &selected {
            println!("Would delete stack {}.", stack);
        }
        println!("Dry run — no changes applied.");
        return Ok(());
    }

    let provider = provider_for(&config)?;
    let deployer = Deployer::new(
        Reconciler::new(&provider, &config.target.template_store_or(&config.name)),
        ImageStore::new(&provider),
        BuiltinTemplates,
        &config.name,
    );
    for stack in selected {
        deployer.undeploy(stack)?;
        println!("{}: deleted.", stack);
    }
    Ok(())
}
