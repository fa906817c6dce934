use std::time::Duration;
use uuid::Uuid;

/// Whether `candidate` is a hyphenated UUID (the form run and attempt ids use).
pub fn is_valid_uuid(candidate: &str) -> bool {
    // 36 chars rules out the simple, braced and urn forms Uuid also accepts
    candidate.len() == 36 && Uuid::parse_str(candidate).is_ok()
}

/// Format a duration as `HH:MM:SS`, truncating fractional seconds.
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Diagnostics to stderr, filtered by `RUST_LOG`. Stdout carries the
/// transcript.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sherlockbench_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Progress line printed before each attempt.
///
/// `current` is 1-based. The estimate is the mean time of the finished
/// attempts multiplied by the attempts still to run (including this one),
/// so the first line carries no estimate.
pub fn progress_line(current: usize, total: usize, elapsed: Duration) -> String {
    let estimate = if current > 1 {
        let finished = (current - 1) as f64;
        let remaining = (total + 1).saturating_sub(current) as f64;
        let per_item = elapsed.as_secs_f64() / finished;
        let secs = (per_item * remaining).max(0.0);
        format!(
            " (est. {} remaining)",
            format_hms(Duration::from_secs_f64(secs))
        )
    } else {
        String::new()
    };

    format!(
        "\n### SYSTEM: Starting attempt {}/{}{}",
        current, total, estimate
    )
}
