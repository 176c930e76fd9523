//! Alternate nickname policy used when registration hits a nick collision.
//!
//! Configured alternates are tried first, in order; after those the base
//! nickname is extended with the suffix once per remaining attempt
//! (`bot1_`, `bot1__`, ...).

/// Nickname for the `attempt`-th retry (1-based).
pub fn alternate_nick(base: &str, alt_nicks: &[String], suffix: &str, attempt: u32) -> String {
    let idx = attempt.saturating_sub(1) as usize;
    if let Some(alt) = alt_nicks.get(idx) {
        return alt.clone();
    }
    let repeats = attempt as usize - alt_nicks.len().min(attempt as usize);
    format!("{}{}", base, suffix.repeat(repeats.max(1)))
}
