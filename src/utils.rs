// ABOUTME: Small helpers shared across the relay
// ABOUTME: Fixed-backoff retry, MySQL identifier quoting, URL redaction and client naming

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use url::Url;

/// Resolves once `stop` reads `true`, or once its sender is gone.
pub async fn stop_requested(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopping| *stopping).await;
}

/// Retries `operation` until it succeeds, sleeping `delay` between attempts.
///
/// Each failure is logged at warn with `what` and the attempt number. There is
/// no attempt cap; callers that need to give up wrap this in a timeout or a
/// `select!` against their shutdown signal.
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use cdc_relay::utils::retry_until_ok;
/// # async fn example() {
/// let value = retry_until_ok("load checkpoint", Duration::from_secs(1), || async {
///     Ok::<_, anyhow::Error>(42)
/// })
/// .await;
/// assert_eq!(value, 42);
/// # }
/// ```
pub async fn retry_until_ok<F, Fut, T, E>(what: &str, delay: Duration, mut operation: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u64 = 1;
    loop {
        match operation().await {
            Ok(value) => return value,
            Err(err) => {
                tracing::warn!(
                    attempt,
                    error = %err,
                    "{} failed, retrying in {:?}",
                    what,
                    delay
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Quote a MySQL identifier with backticks, doubling embedded backticks.
///
/// ```
/// use cdc_relay::utils::quote_mysql_ident;
/// assert_eq!(quote_mysql_ident("orders"), "`orders`");
/// assert_eq!(quote_mysql_ident("odd`name"), "`odd``name`");
/// ```
pub fn quote_mysql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        if ch == '`' {
            quoted.push('`');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

/// Remove credentials from a URL so it can be logged.
pub fn strip_password_from_url(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url).with_context(|| format!("Invalid URL '{}'", url))?;
    if parsed.password().is_some() {
        // Only fails for cannot-be-a-base URLs, which never carry a password.
        let _ = parsed.set_password(None);
    }
    Ok(parsed.to_string())
}

/// Local host name from `$HOSTNAME` or the `hostname` command, else "unknown".
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_owned();
        }
    }
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Client name announced to sinks and written to the startup log.
pub fn client_name() -> String {
    format!("cdc-relay-{}", hostname())
}
