pub mod order_flow;
pub mod spot;
pub mod ta_poller;

use rand::Rng;

/// Jittered reconnect delay: exponential base from the config plus up to
/// 250 ms of uniform noise so a fleet of streams does not thunder back in
/// lockstep.
pub(crate) fn reconnect_delay(backoff: &crate::config::BackoffParams, attempt: u32) -> std::time::Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    std::time::Duration::from_millis(backoff.delay_ms(attempt) + jitter_ms)
}
