//! Implementation of the `portrait init` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tokio::fs;

use crate::adapters::corpus::InMemoryQuestionCorpus;
use crate::adapters::sqlite::initialize_database;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, DatabaseConfig};
use crate::infrastructure::config::PROJECT_DIR;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config and starter corpus
    #[arg(long, short)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

#[derive(Debug, serde::Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub message: String,
    pub initialized_path: PathBuf,
    pub files_written: Vec<String>,
    pub database_initialized: bool,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        if !self.files_written.is_empty() {
            lines.push("\nWrote:".to_string());
            for file in &self.files_written {
                lines.push(format!("  - {file}"));
            }
        }
        if self.database_initialized {
            lines.push(format!("\nDatabase initialized at {PROJECT_DIR}/portrait.db"));
        }
        lines.join("\n")
    }
}

/// A small corpus so a fresh project can route questions immediately.
const STARTER_CORPUS: &str = r#"questions:
  - id: identity-001
    domain: IDENTITY
    text: What three words would a close friend use to describe you?
    depth_level: 1
    energy_dynamic: OPENING
    connections: [identity-002]
  - id: identity-002
    domain: IDENTITY
    text: Which of those words feels least true to how you see yourself?
    depth_level: 2
    energy_dynamic: PROCESSING
  - id: relationships-001
    domain: RELATIONSHIPS
    text: Who do you call first when something good happens?
    depth_level: 1
    energy_dynamic: OPENING
  - id: relationships-002
    domain: RELATIONSHIPS
    text: Describe a relationship that changed how you treat people.
    depth_level: 3
    energy_dynamic: HEAVY
    safety_level: 4
    trust_requirement: 2
  - id: work-001
    domain: WORK
    text: What part of your work makes time disappear?
    depth_level: 1
    energy_dynamic: NEUTRAL
  - id: values-001
    domain: VALUES
    text: What is something you refuse to compromise on?
    depth_level: 2
    energy_dynamic: PROCESSING
  - id: emotions-001
    domain: EMOTIONS
    text: How do you usually notice that you are stressed?
    depth_level: 2
    energy_dynamic: PROCESSING
  - id: growth-001
    domain: GROWTH
    text: What did you learn recently that surprised you?
    depth_level: 1
    energy_dynamic: OPENING
  - id: lifestyle-001
    domain: LIFESTYLE
    text: Describe a perfect ordinary Sunday.
    depth_level: 1
    energy_dynamic: HEALING
  - id: beliefs-001
    domain: BELIEFS
    text: What belief have you changed your mind about?
    depth_level: 2
    energy_dynamic: NEUTRAL
"#;

pub async fn execute(args: InitArgs, json_mode: bool) -> Result<()> {
    let target_path = if args.path.is_absolute() {
        args.path.clone()
    } else {
        std::env::current_dir().context("Failed to get current directory")?.join(&args.path)
    };
    let project_dir = target_path.join(PROJECT_DIR);
    let config_path = project_dir.join("config.yaml");

    if config_path.exists() && !args.force {
        let output_data = InitOutput {
            success: false,
            message: "Project already initialized. Use --force to rewrite config and corpus.".to_string(),
            initialized_path: target_path,
            files_written: vec![],
            database_initialized: false,
        };
        output(&output_data, json_mode);
        return Ok(());
    }

    fs::create_dir_all(&project_dir)
        .await
        .with_context(|| format!("Failed to create {}", project_dir.display()))?;

    let config = Config::default();
    let yaml = serde_yaml::to_string(&config).context("Failed to render default config")?;
    fs::write(&config_path, yaml)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    let mut files_written = vec![format!("{PROJECT_DIR}/config.yaml")];

    // Guard against shipping a corpus the loader would reject.
    InMemoryQuestionCorpus::from_yaml_str(STARTER_CORPUS).context("Starter corpus is invalid")?;
    let corpus_path = project_dir.join("questions.yaml");
    if args.force || !corpus_path.exists() {
        fs::write(&corpus_path, STARTER_CORPUS)
            .await
            .with_context(|| format!("Failed to write {}", corpus_path.display()))?;
        files_written.push(format!("{PROJECT_DIR}/questions.yaml"));
    }

    let database = DatabaseConfig {
        path: project_dir.join("portrait.db").display().to_string(),
        ..config.database
    };
    initialize_database(&database).await.context("Failed to initialize database")?;

    let output_data = InitOutput {
        success: true,
        message: if args.force {
            "Project reinitialized successfully.".to_string()
        } else {
            "Project initialized successfully.".to_string()
        },
        initialized_path: target_path,
        files_written,
        database_initialized: true,
    };
    output(&output_data, json_mode);
    Ok(())
}
