use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Debug, Parser)]
#[command(
    name = "murmur",
    about = "Slack-native conversational assistant with per-thread memory",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "MURMUR_CONFIG",
        default_value = "murmur.toml",
        help = "Path to the TOML config file; a missing file falls back to env vars and built-in defaults"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "MURMUR_MODEL",
        help = "Override the default chat model from the config file"
    )]
    pub model: Option<String>,

    #[arg(
        long = "system-prompt",
        env = "MURMUR_SYSTEM_PROMPT",
        help = "Override the assistant system prompt"
    )]
    pub system_prompt: Option<String>,

    #[arg(
        long = "store-path",
        env = "MURMUR_STORE_PATH",
        help = "Override the SQLite thread store path"
    )]
    pub store_path: Option<PathBuf>,

    #[arg(
        long = "no-store",
        env = "MURMUR_NO_STORE",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Run without the persistent store; threads rebuild from platform history only"
    )]
    pub no_store: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn unit_defaults_point_at_murmur_toml_with_the_store_enabled() {
        let cli = Cli::parse_from(["murmur"]);
        assert_eq!(cli.config, std::path::PathBuf::from("murmur.toml"));
        assert!(cli.model.is_none());
        assert!(cli.system_prompt.is_none());
        assert!(cli.store_path.is_none());
        assert!(!cli.no_store);
    }

    #[test]
    fn unit_flags_parse_overrides() {
        let cli = Cli::parse_from([
            "murmur",
            "--config",
            "/etc/murmur/prod.toml",
            "--model",
            "gpt-4o-mini",
            "--no-store",
        ]);
        assert_eq!(cli.config, std::path::PathBuf::from("/etc/murmur/prod.toml"));
        assert_eq!(cli.model.as_deref(), Some("gpt-4o-mini"));
        assert!(cli.no_store);
    }
}
