/// Readiness waits
///
/// Either a blocking wait delegated to the tool (`kubectl wait`, `cilium status --wait`)
/// or a fixed-interval poll. Both fail with `LabError::Timeout`; the blocking form
/// attaches a diagnostic dump of the current state.
use crate::error::{LabError, Result};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use std::future::Future;
use std::time::Duration;

/// Extra time granted to the wait process beyond its own `--timeout`.
const WAIT_GRACE: Duration = Duration::from_secs(30);

/// Run a blocking wait command; on failure or expiry, run `diagnostics` and
/// return a timeout carrying their output.
pub async fn wait_with_diagnostics(
    runner: &dyn CommandRunner,
    what: &str,
    wait: CommandSpec,
    timeout: Duration,
    diagnostics: &[CommandSpec],
) -> Result<CommandOutput> {
    tracing::info!("[Wait] Waiting up to {:?} for {}", timeout, what);
    let start = std::time::Instant::now();
    let wait = wait.with_timeout(timeout + WAIT_GRACE);

    let failure = match runner.run(&wait).await {
        Ok(output) if output.success() => {
            tracing::info!(
                "[Wait] {} ready (took {}ms)",
                what,
                start.elapsed().as_millis()
            );
            return Ok(output);
        }
        Ok(output) => output.check(&wait).err(),
        Err(e @ LabError::Timeout { .. }) => Some(e),
        Err(e) => return Err(e),
    };

    tracing::error!(
        "[Wait] {} not ready after {}ms, collecting diagnostics",
        what,
        start.elapsed().as_millis()
    );
    let dump = collect_diagnostics(runner, diagnostics).await;
    let err = failure.unwrap_or_else(|| LabError::Timeout {
        what: what.to_string(),
        timeout,
        diagnostics: None,
    });
    Err(err.into_timeout(what, timeout, dump))
}

/// Run each diagnostic command, concatenating output. Never fails.
pub async fn collect_diagnostics(runner: &dyn CommandRunner, specs: &[CommandSpec]) -> String {
    let mut dump = String::new();
    for spec in specs {
        dump.push_str(&format!("$ {}\n", spec.display()));
        match runner.run(spec).await {
            Ok(output) => {
                dump.push_str(output.stdout.trim_end());
                if !output.stderr.trim().is_empty() {
                    dump.push('\n');
                    dump.push_str(output.stderr.trim_end());
                }
            }
            Err(e) => dump.push_str(&format!("(failed: {})", e)),
        }
        dump.push_str("\n\n");
    }
    dump
}

/// Poll `check` every `interval` until it yields a value or `timeout` expires.
/// Errors from `check` are logged and retried.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = tokio::time::Instant::now();
    loop {
        match check().await {
            Ok(Some(value)) => {
                tracing::info!(
                    "[Wait] {} ready (took {:?})",
                    what,
                    start.elapsed()
                );
                return Ok(value);
            }
            Ok(None) => tracing::debug!("[Wait] {} not ready yet", what),
            Err(e) => tracing::warn!("[Wait] {} check failed (retrying): {}", what, e),
        }

        if start.elapsed() + interval > timeout {
            return Err(LabError::Timeout {
                what: what.to_string(),
                timeout,
                diagnostics: None,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_value() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let value = poll_until(
            "gateway address",
            Duration::from_secs(60),
            Duration::from_secs(2),
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(LabError::Discovery("not yet".to_string()))
                    } else if n < 3 {
                        Ok(None)
                    } else {
                        Ok(Some("172.18.255.200".to_string()))
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, "172.18.255.200");
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let result: Result<()> = poll_until(
            "nothing",
            Duration::from_secs(10),
            Duration::from_secs(3),
            || async { Ok(None) },
        )
        .await;
        match result {
            Err(LabError::Timeout { what, timeout, .. }) => {
                assert_eq!(what, "nothing");
                assert_eq!(timeout, Duration::from_secs(10));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
