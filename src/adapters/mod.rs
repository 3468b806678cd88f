//! Adapters that turn external programs into pipeline stages.

pub mod command;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::core::pipeline::{ConfigError, PipelineConfig};
use crate::core::stage::{Stage, StageContext, StageOutcome, StageRegistry};

pub use command::{CommandStage, StageInput};

/// Registry with a `CommandStage` for every configured stage. Each stage
/// must set `stages.<name>.command`.
pub fn command_registry(config: &PipelineConfig) -> Result<StageRegistry, ConfigError> {
    build_registry(config, false)
}

/// Registry for planning only. Stages without a command get a placeholder
/// that refuses to run, so a dry run works against the bare defaults.
pub fn dry_run_registry(config: &PipelineConfig) -> Result<StageRegistry, ConfigError> {
    build_registry(config, true)
}

fn build_registry(config: &PipelineConfig, allow_unbound: bool) -> Result<StageRegistry, ConfigError> {
    let mut registry = StageRegistry::new();
    for settings in &config.stages {
        let field = format!("stages.{}.command", settings.name);
        let stage: Arc<dyn Stage> = match CommandStage::from_settings(settings) {
            None if allow_unbound => Arc::new(Unbound),
            None => return Err(ConfigError::MissingField { field }),
            Some(Err(e)) => {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: e.to_string(),
                })
            }
            Some(Ok(stage)) => Arc::new(stage),
        };
        registry.register(settings.name.clone(), stage);
    }
    Ok(registry)
}

/// Stand-in for a stage with no command configured
struct Unbound;

#[async_trait]
impl Stage for Unbound {
    async fn run(&self, ctx: StageContext) -> Result<StageOutcome> {
        bail!("stage '{}' has no command configured", ctx.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::ConfigOverrides;
    use crate::core::{Orchestrator, RunOutcome, RunRequest};
    use crate::domain::WorkItemId;
    use tempfile::TempDir;

    #[test]
    fn test_missing_command_names_field() {
        let err = command_registry(&PipelineConfig::default()).unwrap_err();
        assert_eq!(err.field(), Some("stages.triage.command"));
    }

    #[test]
    fn test_every_stage_with_command_is_registered() {
        let yaml = r#"
order: [triage, build]
stages:
  triage:
    command: ["echo", "triage"]
  build:
    command: ["make"]
    blocked_exit_code: 42
"#;
        let overrides = ConfigOverrides::from_yaml(yaml, "test").unwrap();
        let config = PipelineConfig::resolve(&overrides).unwrap();

        let registry = command_registry(&config).unwrap();
        assert!(registry.contains("triage"));
        assert!(registry.contains("build"));
    }

    #[test]
    fn test_dry_run_registry_covers_stages_without_commands() {
        let registry = dry_run_registry(&PipelineConfig::default()).unwrap();
        for stage in PipelineConfig::default().stage_names() {
            assert!(registry.contains(stage), "missing {stage}");
        }
    }

    #[test]
    fn test_dry_run_registry_still_rejects_bad_commands() {
        let mut config = PipelineConfig::default();
        config.stages[0].command = Some(vec![" ".to_string()]);
        let first = config.stages[0].name.clone();

        let err = dry_run_registry(&config).unwrap_err();
        assert_eq!(err.field(), Some(format!("stages.{}.command", first).as_str()));
    }

    #[tokio::test]
    async fn test_dry_run_plans_default_pipeline() {
        let temp = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let registry = dry_run_registry(&config).unwrap();
        let orch = Orchestrator::builder(config, registry)
            .home(temp.path().join("home"))
            .artifacts_root(temp.path().join("artifacts"))
            .build()
            .unwrap();

        let report = orch
            .run(RunRequest::new(WorkItemId::new("42").unwrap()).dry_run())
            .await
            .unwrap();

        assert!(matches!(report.outcome, RunOutcome::Planned { .. }), "outcome: {:?}", report.outcome);
    }
}
