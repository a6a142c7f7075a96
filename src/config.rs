//! Configuration types.
//!
//! Everything deployment-specific (who may command the bot, where finished
//! files go, timeouts, directories, command keywords) is read from the
//! environment once at startup and never mutated afterwards.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Telegram Bot API endpoint.
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Static set of sender identifiers allowed to issue fetch commands.
///
/// The entry `*` allows everyone. Matching is exact and case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    senders: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            senders: senders
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    /// Check if a sender is permitted.
    pub fn is_allowed(&self, sender: &str) -> bool {
        !sender.is_empty() && (self.senders.contains("*") || self.senders.contains(sender))
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Human-readable summary for the startup banner.
    pub fn describe(&self) -> String {
        if self.senders.contains("*") {
            "everyone".to_string()
        } else if self.senders.is_empty() {
            "none (deny all)".to_string()
        } else {
            let mut senders: Vec<&str> = self.senders.iter().map(String::as_str).collect();
            senders.sort_unstable();
            senders.join(", ")
        }
    }
}

/// Command keywords, per fetch kind. Compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keywords {
    pub http: Vec<String>,
    pub torrent: Vec<String>,
}

impl Default for Keywords {
    fn default() -> Self {
        Self {
            http: vec!["download".to_string()],
            torrent: vec!["downloadtorrent".to_string()],
        }
    }
}

/// Which messaging network the bot attaches to.
#[derive(Debug, Clone)]
pub enum SessionConfig {
    /// Telegram Bot API via long polling.
    Telegram {
        bot_token: SecretString,
        api_base: String,
    },
    /// Local stdin/stdout session.
    Cli,
}

impl SessionConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Telegram { .. } => "telegram",
            Self::Cli => "cli",
        }
    }
}

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Senders permitted to issue fetch commands.
    pub allow_list: AllowList,
    /// Destinations receiving completed files, in order.
    pub relay_targets: Vec<String>,
    /// Also relay completed files back to the requesting conversation.
    pub relay_to_requester: bool,
    /// Total-operation timeout for one HTTP fetch.
    pub fetch_timeout: Duration,
    /// Optional upper bound on one swarm download.
    pub torrent_timeout: Option<Duration>,
    /// Directory holding downloaded files.
    pub download_dir: PathBuf,
    pub keywords: Keywords,
    /// Maximum number of fetches running at once; the rest stay queued.
    pub max_concurrent_fetches: usize,
    /// Remove the local file once every relay target received it.
    pub delete_after_relay: bool,
    /// Answer unauthorized senders instead of ignoring them.
    pub reply_unauthorized: bool,
    /// Cap for the reconnect backoff.
    pub reconnect_max_delay: Duration,
    pub session: SessionConfig,
    /// File receiving a copy of the log, appended to.
    pub log_file: Option<PathBuf>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            allow_list: AllowList::default(),
            relay_targets: Vec::new(),
            relay_to_requester: false,
            fetch_timeout: Duration::from_secs(60),
            torrent_timeout: None,
            download_dir: PathBuf::from("./downloads"),
            keywords: Keywords::default(),
            max_concurrent_fetches: 4,
            delete_after_relay: false,
            reply_unauthorized: false,
            reconnect_max_delay: Duration::from_secs(60),
            session: SessionConfig::Cli,
            log_file: None,
        }
    }
}

impl BotConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let allow_list = AllowList::new(split_list(
            lookup("COURIER_ALLOWED_SENDERS").as_deref().unwrap_or(""),
        ));

        let relay_targets = dedup(split_list(
            lookup("COURIER_RELAY_TARGETS").as_deref().unwrap_or(""),
        ));

        let relay_to_requester = parse_bool(&lookup, "COURIER_RELAY_TO_REQUESTER")?
            .unwrap_or(defaults.relay_to_requester);

        let fetch_timeout = parse_u64(&lookup, "COURIER_FETCH_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.fetch_timeout);
        if fetch_timeout.is_zero() {
            return Err(invalid("COURIER_FETCH_TIMEOUT_SECS", "must be greater than zero"));
        }

        let torrent_timeout = parse_u64(&lookup, "COURIER_TORRENT_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let download_dir = lookup("COURIER_DOWNLOAD_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.download_dir);

        let keywords = Keywords {
            http: keyword_list(&lookup, "COURIER_HTTP_KEYWORDS", defaults.keywords.http)?,
            torrent: keyword_list(&lookup, "COURIER_TORRENT_KEYWORDS", defaults.keywords.torrent)?,
        };
        if let Some(shared) = keywords.http.iter().find(|k| keywords.torrent.contains(k)) {
            return Err(invalid(
                "COURIER_TORRENT_KEYWORDS",
                &format!("keyword '{shared}' is also an HTTP keyword"),
            ));
        }

        let max_concurrent_fetches = parse_u64(&lookup, "COURIER_MAX_CONCURRENT_FETCHES")?
            .map(|n| n as usize)
            .unwrap_or(defaults.max_concurrent_fetches);
        if max_concurrent_fetches == 0 {
            return Err(invalid(
                "COURIER_MAX_CONCURRENT_FETCHES",
                "must be greater than zero",
            ));
        }

        let delete_after_relay = parse_bool(&lookup, "COURIER_DELETE_AFTER_RELAY")?
            .unwrap_or(defaults.delete_after_relay);
        let reply_unauthorized = parse_bool(&lookup, "COURIER_REPLY_UNAUTHORIZED")?
            .unwrap_or(defaults.reply_unauthorized);

        let reconnect_max_delay = parse_u64(&lookup, "COURIER_RECONNECT_MAX_DELAY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconnect_max_delay);

        let session = match lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.trim().is_empty()) {
            Some(token) => SessionConfig::Telegram {
                bot_token: SecretString::from(token.trim().to_string()),
                api_base: lookup("TELEGRAM_API_BASE")
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.trim().trim_end_matches('/').to_string())
                    .unwrap_or_else(|| TELEGRAM_API_BASE.to_string()),
            },
            None => SessionConfig::Cli,
        };

        let log_file = lookup("COURIER_LOG_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            allow_list,
            relay_targets,
            relay_to_requester,
            fetch_timeout,
            torrent_timeout,
            download_dir,
            keywords,
            max_concurrent_fetches,
            delete_after_relay,
            reply_unauthorized,
            reconnect_max_delay,
            session,
            log_file,
        })
    }

    /// Destinations for a completed file requested from `requester`.
    ///
    /// Falls back to the requester when no relay target is configured.
    pub fn relay_targets_for(&self, requester: &str) -> Vec<String> {
        let mut targets = self.relay_targets.clone();
        if (self.relay_to_requester || targets.is_empty())
            && !targets.iter().any(|t| t == requester)
        {
            targets.push(requester.to_string());
        }
        targets
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn keyword_list<F>(lookup: &F, key: &str, default: Vec<String>) -> Result<Vec<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let keywords: Vec<String> = split_list(&raw)
        .into_iter()
        .map(|k| k.to_lowercase())
        .collect();
    if keywords.is_empty() {
        return Err(invalid(key, "at least one keyword is required"));
    }
    if let Some(bad) = keywords
        .iter()
        .find(|k| k.contains(char::is_whitespace) || k.contains('['))
    {
        return Err(invalid(key, &format!("keyword '{bad}' contains whitespace or '['")));
    }
    Ok(dedup(keywords))
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &format!("'{raw}' is not a non-negative integer"))),
    }
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|s| s.trim().to_lowercase()) {
        None => Ok(None),
        Some(raw) => match raw.as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(invalid(key, &format!("'{raw}' is not a boolean"))),
        },
    }
}
