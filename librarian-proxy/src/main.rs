//! Librarian Proxy - OpenAI-compatible gateway for stateful agent sessions.
//!
//! ## Quick Start
//!
//! ```bash
//! LETTA_BASE_URL=http://localhost:8283 librarian-proxy
//!
//! # Custom bind address and admission budget
//! LETTA_BASE_URL=http://localhost:8283 LIBRARIAN_PORT=9000 \
//!     LIBRARIAN_MAX_CONCURRENT=4 librarian-proxy
//! ```
//!
//! ## Usage with OpenAI clients
//!
//! ```python
//! from openai import OpenAI
//!
//! client = OpenAI(base_url="http://localhost:8000/v1", api_key="not-needed")
//!
//! response = client.chat.completions.create(
//!     model="gpt-4",
//!     messages=[{"role": "user", "content": "Hello!"}]
//! )
//! ```

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use librarian_proxy::{run_server, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("LIBRARIAN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("librarian_proxy={level},tower_http={level}"))
    });

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let config = ProxyConfig::from_env().context("invalid configuration")?;
    run_server(config).await
}
