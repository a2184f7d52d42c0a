use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Validated player intents.
pub mod intent;
/// Profile statistics over game records.
pub mod stats;
/// Custom field validators.
pub mod validation;
/// Render-ready session views.
pub mod view;

/// Render epoch milliseconds as an RFC 3339 timestamp.
pub fn format_epoch_millis(millis: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|timestamp| timestamp.format(&Rfc3339).ok())
        .unwrap_or_else(|| "invalid-timestamp".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_millis_as_rfc3339() {
        assert_eq!(format_epoch_millis(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_epoch_millis(86_400_000), "1970-01-02T00:00:00Z");
    }
}
