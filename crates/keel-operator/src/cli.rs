use std::time::Duration;

use clap::{Parser, Subcommand};

use keel_application::ControllerSettings;
use keel_common::telemetry::LogFormat;

/// Keel - Application operator for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
pub struct Cli {
    /// Namespace holding shared platform records
    #[arg(long, env = "KEEL_SYSTEM_NAMESPACE", default_value = keel_common::KEEL_SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Name of the ConfigMap with the workload identity pool settings
    #[arg(
        long,
        env = "KEEL_IDENTITY_CONFIG_NAME",
        default_value = keel_application::settings::DEFAULT_IDENTITY_CONFIG_NAME
    )]
    pub identity_config_name: String,

    /// Namespace of the ingress gateways denied access to actuator paths
    #[arg(
        long,
        env = "KEEL_INGRESS_GATEWAY_NAMESPACE",
        default_value = keel_application::settings::DEFAULT_INGRESS_GATEWAY_NAMESPACE
    )]
    pub ingress_gateway_namespace: String,

    /// Prefix of the `<prefix>-<priority>` priority classes
    #[arg(
        long,
        env = "KEEL_PRIORITY_CLASS_PREFIX",
        default_value = keel_application::settings::DEFAULT_PRIORITY_CLASS_PREFIX
    )]
    pub priority_class_prefix: String,

    /// Deadline for each resource type step of a reconciliation cycle
    #[arg(long, env = "KEEL_STEP_TIMEOUT_SECS", default_value_t = 30)]
    pub step_timeout_secs: u64,

    /// Log output format (json or text)
    #[arg(long, env = "KEEL_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Apply the Application CRD before starting the controller
    #[arg(long, env = "KEEL_INSTALL_CRDS")]
    pub install_crds: bool,

    /// Subcommand, `controller` when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Operator modes
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the Application controller (default mode)
    Controller,
    /// Print the Application CRD as YAML and exit
    Crd,
}

impl Cli {
    /// Settings handed to every reconciliation cycle
    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            system_namespace: self.system_namespace.clone(),
            identity_config_name: self.identity_config_name.clone(),
            ingress_gateway_namespace: self.ingress_gateway_namespace.clone(),
            priority_class_prefix: self.priority_class_prefix.clone(),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_controller_defaults() {
        let cli = Cli::try_parse_from(["keel"]).expect("parse");
        assert_eq!(cli.command, None);
        assert!(!cli.install_crds);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.settings(), ControllerSettings::default());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::try_parse_from([
            "keel",
            "--system-namespace",
            "platform",
            "--ingress-gateway-namespace",
            "gateways",
            "--step-timeout-secs",
            "5",
            "--log-format",
            "text",
            "--install-crds",
            "controller",
        ])
        .expect("parse");

        let settings = cli.settings();
        assert_eq!(settings.system_namespace, "platform");
        assert_eq!(settings.ingress_gateway_namespace, "gateways");
        assert_eq!(settings.step_timeout, Duration::from_secs(5));
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(cli.install_crds);
        assert_eq!(cli.command, Some(Commands::Controller));
    }

    #[test]
    fn crd_subcommand_parses() {
        let cli = Cli::try_parse_from(["keel", "crd"]).expect("parse");
        assert_eq!(cli.command, Some(Commands::Crd));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["keel", "--log-format", "xml"]).is_err());
    }
}
