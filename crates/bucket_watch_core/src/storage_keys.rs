pub const DEFAULT_REPORT_PREFIX: &str = "reports";
pub const REPORT_FILE_NAME: &str = "plot.svg";
pub const REPORT_CONTENT_TYPE: &str = "image/svg+xml";
pub const DEFAULT_ALARM_STATE_KEY: &str = "alarm/state.json";

pub fn report_object_key(base_prefix: &str) -> String {
    let trimmed = base_prefix.trim_matches('/');
    if trimmed.is_empty() {
        REPORT_FILE_NAME.to_string()
    } else {
        format!("{trimmed}/{REPORT_FILE_NAME}")
    }
}

pub fn object_url(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{}", key.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_report_key_under_prefix() {
        assert_eq!(report_object_key("reports/"), "reports/plot.svg");
        assert_eq!(
            report_object_key("/nested/reports"),
            "nested/reports/plot.svg"
        );
    }

    #[test]
    fn empty_prefix_writes_at_bucket_root() {
        assert_eq!(report_object_key(""), "plot.svg");
    }

    #[test]
    fn builds_object_url() {
        assert_eq!(
            object_url("watch-bucket", "reports/plot.svg"),
            "s3://watch-bucket/reports/plot.svg"
        );
    }
}
