use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use reqwest::blocking::{Client, Response};

// Upper bound; each collaborator sets a shorter per-request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 10;
const BODY_SNIPPET_CHARS: usize = 200;

pub const USER_AGENT_VALUE: &str = "steam-sale-forecast/0.1";

static CLIENT: OnceCell<Client> = OnceCell::new();

pub fn http_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")
    })
}

/// Reads the body of a response, turning non-success statuses into errors that
/// carry a short snippet of what the server said.
pub fn read_success_body(resp: Response) -> Result<String> {
    let status = resp.status();
    let body = resp.text().context("failed reading body")?;
    if !status.is_success() {
        return Err(anyhow!("http {}: {}", status, snippet(&body)));
    }
    Ok(body)
}

pub fn snippet(body: &str) -> String {
    body.chars()
        .take(BODY_SNIPPET_CHARS)
        .collect::<String>()
        .replace('\n', " ")
}
