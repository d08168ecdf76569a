//! Background health probing
//!
//! A periodic task issues a lightweight request to each provider whose
//! circuit is OPEN. A successful probe moves the circuit to HALF_OPEN ahead
//! of the open-duration timer, so recovery is detected without waiting for
//! live traffic to be risked.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::breaker::CircuitState;
use crate::tracker::HealthTracker;

/// One probe destination: provider id plus a URL that answers cheaply.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub provider_id: String,
    pub url: String,
}

/// Spawn the probe loop. `targets` is re-evaluated every cycle so the task
/// follows configuration reloads without being restarted.
pub fn spawn_probe_task<F>(
    tracker: Arc<HealthTracker>,
    client: reqwest::Client,
    interval: Duration,
    targets: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Vec<ProbeTarget> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; nothing can be open yet at startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            probe_cycle(&tracker, &client, &targets()).await;
        }
    })
}

/// Run one probe cycle against every OPEN provider.
async fn probe_cycle(tracker: &HealthTracker, client: &reqwest::Client, targets: &[ProbeTarget]) {
    for target in targets {
        let record = tracker.record(&target.provider_id);
        if record.state() != CircuitState::Open {
            continue;
        }
        debug!(provider_id = %target.provider_id, url = %target.url, "probing open provider");
        match client
            .get(&target.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) if probe_ok(response.status().as_u16()) => {
                info!(provider_id = %target.provider_id, "probe succeeded");
                record.probe_succeeded();
            }
            Ok(response) => {
                debug!(
                    provider_id = %target.provider_id,
                    status = response.status().as_u16(),
                    "probe returned unhealthy status"
                );
            }
            Err(e) => {
                warn!(provider_id = %target.provider_id, error = %e, "probe request failed");
            }
        }
    }
}

/// A probe counts as healthy unless the status is in the failure class.
/// Auth errors (401/404 on a bare GET) still prove the backend is up.
fn probe_ok(status: u16) -> bool {
    !matches!(status, 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_ok_accepts_auth_rejections() {
        assert!(probe_ok(200));
        assert!(probe_ok(401));
        assert!(probe_ok(404));
    }

    #[test]
    fn probe_ok_rejects_failure_class() {
        for status in [429, 500, 502, 503, 504] {
            assert!(!probe_ok(status), "{status}");
        }
    }
}
