//! Configuration loading: `murmur.toml` sections resolved over each
//! component's defaults, with env vars for secrets and CLI flags on top.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use murmur_ai::OpenAiConfig;
use murmur_orchestrator::OrchestratorConfig;
use murmur_platform::{SlackClientConfig, StreamingLimits};
use murmur_stream::RateLimiterConfig;
use murmur_thread::BudgetTuning;

use crate::cli::Cli;
use crate::socket::SocketConfig;

/// Everything the process needs, resolved and validated. Precedence per
/// field: CLI flag, then env var, then config file, then built-in default.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub slack: SlackClientConfig,
    pub openai: OpenAiConfig,
    pub orchestrator: OrchestratorConfig,
    pub tuning: BudgetTuning,
    pub limiter: RateLimiterConfig,
    pub store_path: Option<PathBuf>,
    pub socket: SocketConfig,
}

impl AppConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = if cli.config.exists() {
            let content = std::fs::read_to_string(&cli.config)
                .with_context(|| format!("failed to read config from {}", cli.config.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", cli.config.display()))?
        } else {
            ConfigFile::default()
        };
        Self::resolve(file, cli, EnvOverrides::from_process())
    }

    fn resolve(file: ConfigFile, cli: &Cli, env: EnvOverrides) -> Result<Self> {
        let app_token = env
            .slack_app_token
            .or(file.slack.app_token)
            .filter(|token| !token.trim().is_empty())
            .context("slack app token is required; set SLACK_APP_TOKEN or [slack] app_token")?;
        let bot_token = env
            .slack_bot_token
            .or(file.slack.bot_token)
            .filter(|token| !token.trim().is_empty())
            .context("slack bot token is required; set SLACK_BOT_TOKEN or [slack] bot_token")?;
        let api_key = env
            .openai_api_key
            .or(file.openai.api_key)
            .filter(|key| !key.trim().is_empty())
            .context("llm api key is required; set OPENAI_API_KEY or [openai] api_key")?;

        let streaming_defaults = StreamingLimits::default();
        let streaming = StreamingLimits {
            update_interval_ms: file
                .streaming
                .update_interval_ms
                .unwrap_or(streaming_defaults.update_interval_ms),
            min_update_interval_ms: file
                .streaming
                .min_update_interval_ms
                .unwrap_or(streaming_defaults.min_update_interval_ms),
            buffer_size_threshold: file
                .streaming
                .buffer_size_threshold
                .unwrap_or(streaming_defaults.buffer_size_threshold),
        };

        let slack_defaults = SlackClientConfig::default();
        let slack = SlackClientConfig {
            api_base: file.slack.api_base.unwrap_or(slack_defaults.api_base),
            app_token,
            bot_token,
            request_timeout_ms: file
                .slack
                .request_timeout_ms
                .unwrap_or(slack_defaults.request_timeout_ms),
            retry_max_attempts: file
                .slack
                .retry_max_attempts
                .unwrap_or(slack_defaults.retry_max_attempts),
            retry_base_delay_ms: file
                .slack
                .retry_base_delay_ms
                .unwrap_or(slack_defaults.retry_base_delay_ms),
            max_message_chars: file
                .slack
                .max_message_chars
                .unwrap_or(slack_defaults.max_message_chars),
            streaming,
        };

        let openai_defaults = OpenAiConfig::default();
        let openai = OpenAiConfig {
            api_base: env
                .openai_api_base
                .or(file.openai.api_base)
                .unwrap_or(openai_defaults.api_base),
            api_key,
            organization: file.openai.organization,
            request_timeout_ms: file
                .openai
                .request_timeout_ms
                .unwrap_or(openai_defaults.request_timeout_ms),
            max_retries: file.openai.max_retries.unwrap_or(openai_defaults.max_retries),
            retry_budget_ms: file
                .openai
                .retry_budget_ms
                .unwrap_or(openai_defaults.retry_budget_ms),
        };

        let chat_defaults = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            default_model: cli
                .model
                .clone()
                .or(file.models.default)
                .unwrap_or(chat_defaults.default_model),
            classifier_model: file
                .models
                .classifier
                .unwrap_or(chat_defaults.classifier_model),
            image_model: file.models.image.unwrap_or(chat_defaults.image_model),
            vision_model: file.models.vision.unwrap_or(chat_defaults.vision_model),
            system_prompt: cli
                .system_prompt
                .clone()
                .or(file.chat.system_prompt)
                .unwrap_or(chat_defaults.system_prompt),
            streaming_default: file
                .chat
                .streaming
                .unwrap_or(chat_defaults.streaming_default),
            temperature: file.chat.temperature,
            max_tokens: file.chat.max_tokens,
            image_size: file.chat.image_size,
            image_quality: file.chat.image_quality,
            text_timeout_ms: file
                .chat
                .text_timeout_ms
                .unwrap_or(chat_defaults.text_timeout_ms),
            retry_timeout_ms: file
                .chat
                .retry_timeout_ms
                .unwrap_or(chat_defaults.retry_timeout_ms),
            classify_timeout_ms: file
                .chat
                .classify_timeout_ms
                .unwrap_or(chat_defaults.classify_timeout_ms),
            classify_retry_timeout_ms: file
                .chat
                .classify_retry_timeout_ms
                .unwrap_or(chat_defaults.classify_retry_timeout_ms),
            vision_timeout_ms: file
                .chat
                .vision_timeout_ms
                .unwrap_or(chat_defaults.vision_timeout_ms),
            image_timeout_ms: file
                .chat
                .image_timeout_ms
                .unwrap_or(chat_defaults.image_timeout_ms),
            progress_interval_ms: file
                .chat
                .progress_interval_ms
                .unwrap_or(chat_defaults.progress_interval_ms),
            classify_history_limit: file
                .chat
                .classify_history_limit
                .unwrap_or(chat_defaults.classify_history_limit),
        };

        let tuning_defaults = BudgetTuning::default();
        let tuning = BudgetTuning {
            cleanup_trigger_fraction: file
                .budget
                .cleanup_trigger_fraction
                .unwrap_or(tuning_defaults.cleanup_trigger_fraction),
            warning_fraction: file
                .budget
                .warning_fraction
                .unwrap_or(tuning_defaults.warning_fraction),
            trim_batch_size: file
                .budget
                .trim_batch_size
                .unwrap_or(tuning_defaults.trim_batch_size),
            max_reduction_passes: file
                .budget
                .max_reduction_passes
                .unwrap_or(tuning_defaults.max_reduction_passes),
            response_reserve_tokens: file
                .budget
                .response_reserve_tokens
                .unwrap_or(tuning_defaults.response_reserve_tokens),
            summary_max_tokens: file
                .budget
                .summary_max_tokens
                .unwrap_or(tuning_defaults.summary_max_tokens),
            summary_timeout_ms: file
                .budget
                .summary_timeout_ms
                .unwrap_or(tuning_defaults.summary_timeout_ms),
            cleanup_lock_timeout_ms: file
                .budget
                .cleanup_lock_timeout_ms
                .unwrap_or(tuning_defaults.cleanup_lock_timeout_ms),
        };

        let limiter_defaults = RateLimiterConfig::default();
        let limiter = RateLimiterConfig {
            initial_interval_ms: file
                .limiter
                .initial_interval_ms
                .unwrap_or(limiter_defaults.initial_interval_ms),
            min_interval_ms: file
                .limiter
                .min_interval_ms
                .unwrap_or(limiter_defaults.min_interval_ms),
            max_interval_ms: file
                .limiter
                .max_interval_ms
                .unwrap_or(limiter_defaults.max_interval_ms),
            failure_backoff_multiplier: file
                .limiter
                .failure_backoff_multiplier
                .unwrap_or(limiter_defaults.failure_backoff_multiplier),
            rate_limit_floor_ms: file
                .limiter
                .rate_limit_floor_ms
                .unwrap_or(limiter_defaults.rate_limit_floor_ms),
            success_shrink_streak: file
                .limiter
                .success_shrink_streak
                .unwrap_or(limiter_defaults.success_shrink_streak),
            success_shrink_multiplier: file
                .limiter
                .success_shrink_multiplier
                .unwrap_or(limiter_defaults.success_shrink_multiplier),
            failure_threshold: file
                .limiter
                .failure_threshold
                .unwrap_or(limiter_defaults.failure_threshold),
            failure_window_ms: file
                .limiter
                .failure_window_ms
                .unwrap_or(limiter_defaults.failure_window_ms),
            cooldown_ms: file.limiter.cooldown_ms.unwrap_or(limiter_defaults.cooldown_ms),
        };

        let store_path = if cli.no_store || !file.store.enabled.unwrap_or(true) {
            None
        } else {
            Some(
                cli.store_path
                    .clone()
                    .or(file.store.path)
                    .unwrap_or_else(|| PathBuf::from("murmur.db")),
            )
        };

        let socket_defaults = SocketConfig::default();
        let socket = SocketConfig {
            reconnect_delay_ms: file
                .socket
                .reconnect_delay_ms
                .unwrap_or(socket_defaults.reconnect_delay_ms),
            max_event_age_seconds: file
                .socket
                .max_event_age_seconds
                .unwrap_or(socket_defaults.max_event_age_seconds),
            processed_event_cap: file
                .socket
                .processed_event_cap
                .unwrap_or(socket_defaults.processed_event_cap),
        };

        Ok(Self {
            slack,
            openai,
            orchestrator,
            tuning,
            limiter,
            store_path,
            socket,
        })
    }
}

/// Secrets and endpoints read from the environment; these beat the config
/// file so deployments can keep tokens out of it.
#[derive(Debug, Default)]
struct EnvOverrides {
    slack_app_token: Option<String>,
    slack_bot_token: Option<String>,
    openai_api_key: Option<String>,
    openai_api_base: Option<String>,
}

impl EnvOverrides {
    fn from_process() -> Self {
        Self {
            slack_app_token: non_empty_env("SLACK_APP_TOKEN"),
            slack_bot_token: non_empty_env("SLACK_BOT_TOKEN"),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_api_base: non_empty_env("OPENAI_API_BASE"),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    slack: SlackSection,
    #[serde(default)]
    openai: OpenAiSection,
    #[serde(default)]
    models: ModelsSection,
    #[serde(default)]
    chat: ChatSection,
    #[serde(default)]
    budget: BudgetSection,
    #[serde(default)]
    limiter: LimiterSection,
    #[serde(default)]
    streaming: StreamingSection,
    #[serde(default)]
    store: StoreSection,
    #[serde(default)]
    socket: SocketSection,
}

#[derive(Debug, Default, Deserialize)]
struct SlackSection {
    app_token: Option<String>,
    bot_token: Option<String>,
    api_base: Option<String>,
    request_timeout_ms: Option<u64>,
    retry_max_attempts: Option<usize>,
    retry_base_delay_ms: Option<u64>,
    max_message_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiSection {
    api_key: Option<String>,
    api_base: Option<String>,
    organization: Option<String>,
    request_timeout_ms: Option<u64>,
    max_retries: Option<usize>,
    retry_budget_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelsSection {
    default: Option<String>,
    classifier: Option<String>,
    image: Option<String>,
    vision: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatSection {
    system_prompt: Option<String>,
    streaming: Option<bool>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    image_size: Option<String>,
    image_quality: Option<String>,
    text_timeout_ms: Option<u64>,
    retry_timeout_ms: Option<u64>,
    classify_timeout_ms: Option<u64>,
    classify_retry_timeout_ms: Option<u64>,
    vision_timeout_ms: Option<u64>,
    image_timeout_ms: Option<u64>,
    progress_interval_ms: Option<u64>,
    classify_history_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct BudgetSection {
    cleanup_trigger_fraction: Option<f64>,
    warning_fraction: Option<f64>,
    trim_batch_size: Option<usize>,
    max_reduction_passes: Option<usize>,
    response_reserve_tokens: Option<usize>,
    summary_max_tokens: Option<u32>,
    summary_timeout_ms: Option<u64>,
    cleanup_lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LimiterSection {
    initial_interval_ms: Option<u64>,
    min_interval_ms: Option<u64>,
    max_interval_ms: Option<u64>,
    failure_backoff_multiplier: Option<f64>,
    rate_limit_floor_ms: Option<u64>,
    success_shrink_streak: Option<u32>,
    success_shrink_multiplier: Option<f64>,
    failure_threshold: Option<usize>,
    failure_window_ms: Option<u64>,
    cooldown_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamingSection {
    update_interval_ms: Option<u64>,
    min_update_interval_ms: Option<u64>,
    buffer_size_threshold: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct StoreSection {
    enabled: Option<bool>,
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct SocketSection {
    reconnect_delay_ms: Option<u64>,
    max_event_age_seconds: Option<u64>,
    processed_event_cap: Option<usize>,
}
