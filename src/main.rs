//! Demonstration CLI: loads a resolver configuration and a small built-in
//! fixture network, runs one `resolve` pass, and prints the result. Not
//! part of the specified system (§6 treats requirements/registry/plan as
//! externally supplied); this binary exists only to exercise the crate
//! end to end.

use clap::Parser;
use tracing::error;

use netgen::config::ResolverConfig;
use netgen::dynamics::NullDynamics;
use netgen::hooks::HookChain;
use netgen::instantiate::RequirementTask;
use netgen::model::{ComponentModel, DeploymentModel, StaticRegistry};
use netgen::pipeline::Pipeline;
use netgen::plan::InMemoryPlan;
use netgen::requirement::InstanceRequirements;

#[derive(Parser)]
#[command(name = "netgen")]
#[command(about = "Network generation engine demonstration CLI")]
#[command(version)]
struct Cli {
    /// Path to a TOML resolver configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => match ResolverConfig::from_toml_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(%e, path = %path, "failed to load resolver configuration");
                std::process::exit(1);
            }
        },
        None => fixture_config(),
    };

    let mut registry = StaticRegistry::new();
    registry.register_model(ComponentModel::task_context("Camera"));
    registry.register_deployment(DeploymentModel::new("camera_deployment").hosting("camera_slot", "Camera"));

    let mut real_plan = InMemoryPlan::new();
    let hooks = HookChain::default();
    let mut dynamics = NullDynamics;
    let requirements = vec![RequirementTask {
        id: "camera".to_string(),
        requirements: Box::new(InstanceRequirements::new("Camera")),
    }];

    let mut pipeline = Pipeline::new();
    match pipeline.resolve(&mut real_plan, &registry, &mut dynamics, &hooks, &config, &requirements) {
        Ok(required) => {
            for (id, handle) in &required {
                println!("{id} -> {handle}");
            }
        }
        Err(e) => {
            error!(%e, "resolve failed");
            std::process::exit(1);
        }
    }
}

fn fixture_config() -> ResolverConfig {
    let mut config = ResolverConfig::default();
    config
        .available_deployments
        .insert("localhost".to_string(), vec!["camera_deployment".to_string()]);
    config
}
