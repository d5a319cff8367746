//! Periodic sanity check that the chain is advancing at a plausible rate.

use std::sync::atomic::Ordering;

use log::{debug, warn};

use crate::context::{now_secs, NodeContext};

const SPAN_HOURS: i64 = 4;
const SPAN_SECONDS: i64 = SPAN_HOURS * 60 * 60;
const FIFTY_YEARS: i64 = 50 * 365 * 24 * 60 * 60;
const ALERT_DAMPING_SECS: i64 = 24 * 60 * 60;

/// Poisson probability mass at `k` for rate `lambda`.
fn poisson_pmf(lambda: f64, k: u32) -> f64 {
    let mut p = (-lambda).exp();
    for i in 1..=k {
        p *= lambda / i as f64;
    }
    p
}

/// Alert when the recent block rate is improbably low (likely network
/// partition) or improbably high (likely a runaway fork). Aims for one
/// false positive per fifty years of normal running; fires at most once
/// a day.
pub fn partition_check(ctx: &NodeContext) {
    let now = now_secs();
    {
        let main = ctx.main();
        if main.best_header_id().is_none() || ctx.is_initial_block_download(&main) {
            return;
        }
    }
    if ctx.last_partition_alert.load(Ordering::Relaxed) > now - ALERT_DAMPING_SECS {
        return;
    }

    let blocks_expected = SPAN_SECONDS / ctx.params.consensus.pow_target_spacing;
    let start_time = now - SPAN_SECONDS;

    let observed = {
        let main = ctx.main();
        let Some(best) = main.best_header_id() else {
            return;
        };
        let mut walk = Some(best);
        let mut count = 0u32;
        loop {
            let Some(id) = walk else {
                // ran out of chain; we must not be fully synced
                return;
            };
            let entry = main.block_index.get(id);
            if entry.time() < start_time {
                break;
            }
            count += 1;
            walk = entry.parent;
        }
        count
    };

    let p = poisson_pmf(blocks_expected as f64, observed);
    debug!("partition check: found {observed} blocks in the last {SPAN_HOURS} hours");
    debug!("partition check: likelihood {p:e}");

    let alert_threshold = 1.0 / (FIFTY_YEARS / SPAN_SECONDS) as f64;
    let warning = if p <= alert_threshold && (observed as i64) < blocks_expected {
        Some(format!(
            "WARNING: check your network connection, {observed} blocks received in the last \
             {SPAN_HOURS} hours ({blocks_expected} expected)"
        ))
    } else if p <= alert_threshold && (observed as i64) > blocks_expected {
        Some(format!(
            "WARNING: abnormally high number of blocks generated, {observed} blocks received \
             in the last {SPAN_HOURS} hours ({blocks_expected} expected)"
        ))
    } else {
        None
    };

    if let Some(warning) = warning {
        warn!("{warning}");
        if let Ok(mut misc) = ctx.misc_warning.lock() {
            *misc = warning.clone();
        }
        alert_notify(ctx, &warning);
        ctx.last_partition_alert.store(now, Ordering::Relaxed);
    }
}

/// Run the `-alertnotify` shell template, quoting the sanitized message.
pub fn alert_notify(ctx: &NodeContext, message: &str) {
    ctx.ui.notify_alert_changed();
    let Some(template) = ctx.config.alert_notify.as_ref() else {
        return;
    };
    let safe: String = message
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || " .,;-_/:?@()".contains(*c))
        .collect();
    let command = template.replace("%s", &format!("'{safe}'"));
    ctx.ui.run_alert_command(&command);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmf_matches_reference_values() {
        // poisson(lambda=24): pmf at the mean is ~0.081, far tails vanish
        let at_mean = poisson_pmf(24.0, 24);
        assert!((at_mean - 0.0811).abs() < 0.001);
        assert!(poisson_pmf(24.0, 0) < 1e-9);
        assert!(poisson_pmf(24.0, 100) < 1e-9);
        // sums to ~1
        let total: f64 = (0..200).map(|k| poisson_pmf(24.0, k)).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn threshold_is_rare_but_reachable() {
        let threshold = 1.0 / (FIFTY_YEARS / SPAN_SECONDS) as f64;
        // an ordinary count must not alert
        assert!(poisson_pmf(24.0, 20) > threshold);
        // a stalled chain must
        assert!(poisson_pmf(24.0, 1) <= threshold);
        // and a runaway chain must
        assert!(poisson_pmf(24.0, 90) <= threshold);
    }
}
