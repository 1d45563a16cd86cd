//! # gpt-meter - Metered access to a chat-completion API
//!
//! A reverse proxy that sits between in-house clients and an
//! OpenAI-compatible completion API. Callers authenticate with keys issued
//! by the proxy; the proxy forwards each call with the deployment's own
//! upstream credential and records how many tokens the call consumed,
//! attributed to the caller and the project named in the `X-Project`
//! header.
//!
//! ## Features
//!
//! - **Byte-exact relay**: upstream status, headers and body reach the
//!   client unchanged, including event streams line by line
//! - **Token accounting**: `usage.total_tokens` for plain responses, local
//!   tiktoken counting of prompt and deltas for streamed ones
//! - **Per-project attribution**: projects and models are created on first
//!   use, users are provisioned by an operator
//! - **SQLite ledger**: append-only usage records with monthly summaries
//!
//! ## Call Lifecycle
//!
//! ```text
//! MethodCheck → AuthCheck → ProjectResolve → BodyDecode → ModelResolve
//!     → Forward → Relay → (RecordUsage) → Done
//! ```
//!
//! | Failure | Status |
//! |---------|--------|
//! | Wrong method, query string, malformed body, unsupported model | 400 |
//! | Unknown API key | 401 |
//! | Storage failure | 500 |
//! | Upstream unreachable, timed out or unreadable | 502 |
//!
//! Non-200 upstream responses are relayed as they are and never metered.
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENAI_KEY=sk-...
//! gpt-meter set-user-key alice "$(uuidgen)"
//! gpt-meter serve --port 8080
//! gpt-meter get-usage
//! ```
//!
//! ## Modules
//!
//! - [`proxy`]: HTTP front end, attribution, upstream forwarding, relay
//! - [`store`]: SQLite usage ledger and admin queries
//! - [`tokenizer`]: Model-to-encoding selection and token counting
//! - [`config`]: TOML and environment configuration
//! - [`error`]: Error types

pub mod config;
pub mod error;
pub mod proxy;
pub mod store;
pub mod tokenizer;

// Re-exports for convenience
pub use config::{Config, ProxyConfig, StoreConfig};
pub use error::{MeterError, Result};
pub use proxy::{ProxyError, ProxyServer, RequestKind};
pub use store::{SqliteStore, StoreError};
pub use tokenizer::{BpeTokenizers, Encoding, TokenCounter, Tokenizer, TokenizerSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
