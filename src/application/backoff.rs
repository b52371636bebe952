use rand::Rng;
use std::time::Duration;

/// Exponential backoff with symmetric jitter.
///
/// Attempt 0 waits `base`, each further attempt doubles up to `cap`, and the
/// result is spread by `+/- jitter_frac` so synchronized retries don't land
/// on the exchange in lockstep.
pub fn jittered_backoff(base: Duration, cap: Duration, attempt: u32, jitter_frac: f64) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let capped = exp.min(cap.as_secs_f64());
    let jitter = rand::rng().random_range(-jitter_frac..=jitter_frac);
    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
}
