use std::sync::atomic::{AtomicU32, Ordering};

static EXHAUSTION_REPORTS: AtomicU32 = AtomicU32::new(0);

/// Surface a fatal exhaustion diagnostic to the user.
///
/// Reported at most once per process: repeat exhaustion on every draw of a
/// broken frame would otherwise flood the log. Returns whether this call
/// was the reporting one.
pub fn report_fatal_exhaustion(title: &str, message: &str) -> bool {
    let first = EXHAUSTION_REPORTS.fetch_add(1, Ordering::SeqCst) == 0;
    if first {
        log::error!("{}: {}", title, message);
    }
    first
}

/// Number of exhaustion reports raised so far, counting suppressed ones.
pub fn fatal_exhaustion_count() -> u32 {
    EXHAUSTION_REPORTS.load(Ordering::SeqCst)
}
