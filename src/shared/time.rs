use chrono::Utc;

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn now_nanos() -> u128 {
    Utc::now()
        .timestamp_nanos_opt()
        .map(|nanos| nanos as u128)
        .unwrap_or_default()
}
