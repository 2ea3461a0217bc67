use crate::config::Settings;
use clap::{Args, Parser, Subcommand};

/// Ingress monitor CLI.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// The subcommands supported by the CLI.
#[derive(Subcommand)]
pub enum Commands {
    /// Watch ingresses and reconcile every change until interrupted.
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Namespace to watch.
    #[arg(long, short)]
    pub namespace: Option<String>,

    /// Watch every namespace.
    #[arg(short = 'A', long, default_value_t = false, conflicts_with = "namespace")]
    pub all_namespaces: bool,

    /// Number of concurrent workers.
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Seconds to wait for the initial listing before giving up.
    #[arg(long)]
    pub sync_timeout_secs: Option<u64>,

    /// Label selector restricting the watched ingresses.
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Field selector restricting the watched ingresses.
    #[arg(long)]
    pub field_selector: Option<String>,

    /// Path to a kubeconfig file.
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context to use.
    #[arg(long)]
    pub context: Option<String>,

    /// Path to a YAML settings file. Replaces the environment defaults.
    #[arg(short, long)]
    pub config: Option<String>,
}

impl RunArgs {
    /// Layers the flags that were given on top of `settings`.
    pub fn apply(&self, mut settings: Settings) -> Settings {
        if self.all_namespaces {
            settings.namespace = None;
        } else if let Some(namespace) = &self.namespace {
            settings.namespace = Some(namespace.clone());
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(secs) = self.sync_timeout_secs {
            settings.sync_timeout_secs = secs;
        }
        if let Some(selector) = &self.selector {
            settings.label_selector = Some(selector.clone());
        }
        if let Some(selector) = &self.field_selector {
            settings.field_selector = Some(selector.clone());
        }
        if let Some(path) = &self.kubeconfig {
            settings.kubeconfig_path = Some(path.clone());
        }
        if let Some(context) = &self.context {
            settings.context = Some(context.clone());
        }
        settings
    }
}
