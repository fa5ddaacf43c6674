use time::OffsetDateTime;

/// Wall-clock milliseconds since the Unix epoch.
///
/// Domain code never calls this directly in its logic paths; timestamps are
/// threaded in as parameters so behavior stays deterministic under test.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_plausible() {
        let ts = now_ms();
        // After 2020-01-01 and before 2100.
        assert!(ts > 1_577_836_800_000);
        assert!(ts < 4_102_444_800_000);
    }
}
