//! Last-writer-wins comparison helpers.
//!
//! The engine does not do multi-master conflict-free merging: every key
//! converges to whichever write carries the largest `modified` timestamp,
//! with ties broken in favor of the remote write so every device converges
//! on the same row without further coordination.

use chrono::{DateTime, Utc};

/// Should a remote write with timestamp `remote_modified` overwrite a local
/// shadow row currently at `local_tstamp`?
///
/// A remote write strictly older than the local shadow timestamp is
/// rejected. Equal timestamps favor the remote write.
pub fn remote_wins(local_tstamp: DateTime<Utc>, remote_modified: DateTime<Utc>) -> bool {
    remote_modified >= local_tstamp
}

/// Project only the fields present in `changed_fields` from `remote` onto
/// `local`, leaving every other field untouched; `None` replaces the whole
/// row with `remote`.
pub fn lww_merge_row(
    local: &serde_json::Value,
    remote: &serde_json::Value,
    changed_fields: Option<&[String]>,
) -> serde_json::Value {
    match changed_fields {
        None => remote.clone(),
        Some(fields) => {
            let mut out = local.clone();
            if let (Some(out_obj), Some(remote_obj)) = (out.as_object_mut(), remote.as_object()) {
                for field in fields {
                    if let Some(v) = remote_obj.get(field) {
                        out_obj.insert(field.clone(), v.clone());
                    }
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn strictly_older_remote_write_is_rejected() {
        assert!(!remote_wins(ts(100), ts(99)));
    }

    #[test]
    fn equal_timestamps_favor_remote() {
        assert!(remote_wins(ts(100), ts(100)));
    }

    #[test]
    fn newer_remote_write_wins() {
        assert!(remote_wins(ts(100), ts(101)));
    }

    #[test]
    fn merge_row_only_touches_projected_fields() {
        let local = serde_json::json!({"a": 1, "b": 2});
        let remote = serde_json::json!({"a": 99, "b": 100});
        let merged = lww_merge_row(&local, &remote, Some(&["a".to_string()]));
        assert_eq!(merged, serde_json::json!({"a": 99, "b": 2}));
    }
}
