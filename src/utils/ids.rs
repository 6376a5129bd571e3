use std::time::{SystemTime, UNIX_EPOCH};

/// Collision-resistant job identifier, safe for use as a path component.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
