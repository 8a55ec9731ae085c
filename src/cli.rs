use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use crate::plugin::Plugin;
use crate::ssh::ConnectionSettings;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "drone-chef-client",
    version,
    about = "Run chef-client on a remote host over SSH"
)]
pub struct Args {
    /// ssh user name
    #[arg(long, env = "PLUGIN_USER", default_value = "")]
    pub user: String,

    /// ssh password
    #[arg(long, env = "PLUGIN_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// ssh private key (PEM text); falls back to SSH_PRIVATE_KEY
    #[arg(long, env = "PLUGIN_PRIVATE_KEY", default_value = "", hide_env_values = true)]
    pub private_key: String,

    /// ssh host
    #[arg(long, env = "PLUGIN_HOST", default_value = "")]
    pub host: String,

    /// ssh host public key; falls back to SSH_HOST_KEY
    #[arg(long, env = "PLUGIN_HOST_KEY", default_value = "")]
    pub host_key: String,

    /// ssh port
    #[arg(long, env = "PLUGIN_PORT", default_value_t = 0)]
    pub port: u16,

    /// use the ssh agent; defaults to on when SSH_AUTH_SOCK is set
    #[arg(
        long,
        env = "PLUGIN_AGENT",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub agent: Option<bool>,

    /// ssh timeout, e.g. 30s, 5m, 1h30m
    #[arg(long, env = "PLUGIN_TIMEOUT", default_value = "")]
    pub timeout: String,

    /// ssh bastion user name
    #[arg(long, env = "PLUGIN_BASTION_USER", default_value = "")]
    pub bastion_user: String,

    /// ssh bastion password
    #[arg(long, env = "PLUGIN_BASTION_PASSWORD", default_value = "", hide_env_values = true)]
    pub bastion_password: String,

    /// ssh bastion private key; falls back to SSH_BASTION_PRIVATE_KEY
    #[arg(
        long,
        env = "PLUGIN_BASTION_PRIVATE_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub bastion_private_key: String,

    /// ssh bastion host
    #[arg(long, env = "PLUGIN_BASTION_HOST", default_value = "")]
    pub bastion_host: String,

    /// ssh bastion host public key; falls back to SSH_BASTION_HOST_KEY
    #[arg(long, env = "PLUGIN_BASTION_HOST_KEY", default_value = "")]
    pub bastion_host_key: String,

    /// ssh bastion port
    #[arg(long, env = "PLUGIN_BASTION_PORT", default_value_t = 0)]
    pub bastion_port: u16,

    /// agent key to offer first (key file path or comment); falls back to SSH_AGENT_IDENTITY
    #[arg(long, env = "PLUGIN_AGENT_IDENTITY", default_value = "")]
    pub agent_identity: String,

    /// forward the ssh agent to the remote host when the agent is used
    #[arg(
        long,
        env = "PLUGIN_AGENT_FORWARDING",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub agent_forwarding: bool,

    /// do not request a pseudo-terminal for the remote command
    #[arg(long, env = "PLUGIN_NO_PTY", value_parser = BoolishValueParser::new())]
    pub no_pty: bool,

    /// chef client run list
    #[arg(long, env = "PLUGIN_RUN_LIST", value_delimiter = ',')]
    pub run_list: Vec<String>,

    /// chef client sudo password; falls back to CHEF_CLIENT_SUDO_PASSWORD, SUDO_PASSWORD
    #[arg(long, env = "PLUGIN_SUDO_PASSWORD", default_value = "", hide_env_values = true)]
    pub sudo_password: String,
}

impl Args {
    /// Build the plugin, filling unset values from secondary environment names
    ///
    /// `env` looks up an environment variable; it is a parameter so the
    /// fallbacks can be exercised without touching the process environment.
    pub fn into_plugin(self, env: impl Fn(&str) -> Option<String>) -> Plugin {
        let fallback = |value: String, names: &[&str]| -> String {
            if !value.is_empty() {
                return value;
            }
            names
                .iter()
                .filter_map(|name| env(name))
                .find(|v| !v.is_empty())
                .unwrap_or_default()
        };

        let settings = ConnectionSettings {
            user: self.user,
            password: self.password,
            private_key: fallback(self.private_key, &["SSH_PRIVATE_KEY"]),
            host: self.host,
            host_key: fallback(self.host_key, &["SSH_HOST_KEY"]),
            port: self.port,
            agent: self.agent,
            timeout: self.timeout,
            bastion_user: self.bastion_user,
            bastion_password: self.bastion_password,
            bastion_private_key: fallback(self.bastion_private_key, &["SSH_BASTION_PRIVATE_KEY"]),
            bastion_host: self.bastion_host,
            bastion_host_key: fallback(self.bastion_host_key, &["SSH_BASTION_HOST_KEY"]),
            bastion_port: self.bastion_port,
            agent_identity: fallback(self.agent_identity, &["SSH_AGENT_IDENTITY"]),
            agent_forwarding: self.agent_forwarding,
            no_pty: self.no_pty,
        };

        Plugin {
            settings,
            run_list: self
                .run_list
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            sudo_password: fallback(
                self.sudo_password,
                &["CHEF_CLIENT_SUDO_PASSWORD", "SUDO_PASSWORD"],
            ),
        }
    }
}
