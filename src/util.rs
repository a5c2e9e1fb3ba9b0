//! Shared helpers for the command-line front end.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run synchronous store I/O off the async runtime threads.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Shorten `text` to at most `max` characters, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max && first_line.len() == text.len() {
        return first_line.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut short: String = first_line.chars().take(keep).collect();
    short.push_str("...");
    short
}
