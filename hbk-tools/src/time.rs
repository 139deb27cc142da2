use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as epoch seconds.
pub fn epoch_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}
