//! Metering reverse proxy in front of an OpenAI-compatible completion API.
//!
//! Every call is attributed to a `(user, project)` pair, forwarded upstream
//! unmodified apart from the credential, relayed back byte for byte, and
//! metered into the usage ledger.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        gpt-meter                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  Client ──> MethodCheck ──> Attribution ──> Decode request    │
//! │                              (user, project)   (model, prompt)│
//! │                                                    │          │
//! │                                                    v          │
//! │                                              ┌──────────┐     │
//! │                                              │ Upstream │     │
//! │                                              └──────────┘     │
//! │                                                    │          │
//! │  Client <──────────── Relay (verbatim bytes) <─────┘          │
//! │                          │                                    │
//! │                          └──> token count ──> usage ledger    │
//! │                                                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Call states
//!
//! ```text
//! MethodCheck → AuthCheck → ProjectResolve → BodyDecode → ModelResolve
//!     → Forward → Relay → (RecordUsage) → Done
//! ```
//!
//! Any failed precondition ends the call with one [`ProxyError`]. Nothing
//! is retried and upstream is called at most once.
//!
//! Everything after the inbound body has been read runs on a detached task
//! under its own deadline, so a client that hangs up early is still metered
//! once upstream finishes.
//!
//! # Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Health check |
//! | `/v1/chat/completions` | POST | Metered chat endpoint (`chat` deployments) |
//! | `/v1/completions` | POST | Metered legacy completions (`completion` deployments) |
//!
//! # Client Configuration
//!
//! Point your OpenAI client at the proxy and use the key issued by
//! `gpt-meter set-user-key`. An optional `X-Project` header attributes the
//! call to a project; calls without one land in `<default>`.
//!
//! ```python
//! from openai import OpenAI
//!
//! client = OpenAI(
//!     base_url="http://localhost:8080/v1",
//!     api_key="key-issued-by-gpt-meter",
//!     default_headers={"X-Project": "search-indexer"},
//! )
//! ```

mod attribution;
mod error;
mod relay;
mod request;
mod server;
mod upstream;

pub use attribution::{Attribution, CallContext, DEFAULT_PROJECT, PROJECT_HEADER};
pub use error::ProxyError;
pub use relay::{SseAccumulator, SseMessage, DONE_SENTINEL};
pub use request::{ChatRequest, CompletionRequest, DecodedRequest, RequestKind, RequestShape};
pub use server::{ProxyServer, ProxyState};
pub use upstream::Upstream;
