/// Time fixtures
///
/// Cycle tests anchor the engine clock at a whole second so record start
/// times and quarter boundaries land exactly on timer deadlines.

/// 2023-11-14T22:13:20Z
pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

/// Genesis start (seconds) that places `now_ms` `into_cycle_secs` into
/// cycle 1. Negative values put the start of cycle 1 in the future.
pub fn genesis_start_secs(now_ms: u64, duration_secs: u64, into_cycle_secs: i64) -> u64 {
    let now_secs = (now_ms / 1000) as i64;
    (now_secs - duration_secs as i64 - into_cycle_secs) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_start_secs() {
        let now_secs = TEST_EPOCH_MS / 1000;
        assert_eq!(genesis_start_secs(TEST_EPOCH_MS, 60, 0), now_secs - 60);
        assert_eq!(genesis_start_secs(TEST_EPOCH_MS, 60, 50), now_secs - 110);
        assert_eq!(genesis_start_secs(TEST_EPOCH_MS, 60, -1), now_secs - 59);
    }
}
