/// Anthropic Messages API endpoint and protocol version
pub const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Completion defaults applied when the request leaves them unset
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Message shown for upstream failures whose body carries no readable message
pub const API_ERROR_FALLBACK: &str = "API error";

/// Stream guards
pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
pub const SSE_KEEPALIVE_SECS: u64 = 15;

/// Ingress caps
pub const MAX_HISTORY_TURNS: usize = 1000;

/// Conversation titles: derived from the first user turn
pub const TITLE_MAX_CHARS: usize = 40;
pub const TITLE_ELLIPSIS: &str = "…";

/// Session usernames when the login request carries none
pub const DEFAULT_USERNAME: &str = "guest";

/// Connection pragmas applied to every new database
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
    "PRAGMA foreign_keys = ON",
];
