//! Bucket and object name validation.
//!
//! All checks are pure and total: any string (or byte slice) yields a
//! verdict, never a panic.

use crate::errors::S3Error;

/// Internal housekeeping bucket.
pub const META_BUCKET: &str = ".tessera.sys";

/// Housekeeping namespace for staged multipart data.
pub const META_MULTIPART_BUCKET: &str = ".tessera.sys/multipart";

/// Housekeeping namespace for scratch files.
pub const META_TMP_BUCKET: &str = ".tessera.sys/tmp";

/// Maximum object key length in bytes.
pub const MAX_OBJECT_NAME_LEN: usize = 1024;

const SLASH_SEPARATOR: char = '/';

/// Whether `bucket` is one of the reserved housekeeping buckets.
pub fn is_meta_bucket_name(bucket: &str) -> bool {
    bucket == META_BUCKET || bucket == META_MULTIPART_BUCKET || bucket == META_TMP_BUCKET
}

/// Check a bucket name against the DNS-label naming rules.
///
/// Rules:
/// - 3-63 characters long
/// - One or more labels separated by periods
/// - Labels contain only lowercase letters, digits and hyphens
/// - Labels are non-empty and do not begin or end with a hyphen
/// - Must not look like an IPv4 address (four all-digit labels)
///
/// Reserved housekeeping buckets are always valid.
pub fn is_valid_bucket_name(bucket: &str) -> bool {
    if is_meta_bucket_name(bucket) {
        return true;
    }
    if !(3..=63).contains(&bucket.len()) {
        return false;
    }

    let mut label_count = 0;
    let mut all_numeric = true;
    for label in bucket.split('.') {
        label_count += 1;
        if label.is_empty() || label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        let mut numeric = true;
        for b in label.bytes() {
            match b {
                b'a'..=b'z' | b'-' => numeric = false,
                b'0'..=b'9' => {}
                _ => return false,
            }
        }
        all_numeric &= numeric;
    }

    !(label_count == 4 && all_numeric)
}

/// Validate a bucket name, returning [`S3Error::InvalidBucketName`] on failure.
pub fn validate_bucket_name(bucket: &str) -> Result<(), S3Error> {
    if is_valid_bucket_name(bucket) {
        Ok(())
    } else {
        Err(S3Error::InvalidBucketName {
            bucket: bucket.to_string(),
        })
    }
}

/// Check an object key.
///
/// A key must be non-empty, must not start or end with `/`, and must pass
/// every prefix rule (see [`is_valid_object_prefix`]).
pub fn is_valid_object_name(object: &str) -> bool {
    if object.is_empty() {
        return false;
    }
    if object.starts_with(SLASH_SEPARATOR) || object.ends_with(SLASH_SEPARATOR) {
        return false;
    }
    is_valid_object_prefix(object)
}

/// Check an object key given as raw bytes.
///
/// Bytes that are not valid UTF-8 are an invalid key.
pub fn is_valid_object_name_bytes(object: &[u8]) -> bool {
    match std::str::from_utf8(object) {
        Ok(s) => is_valid_object_name(s),
        Err(_) => false,
    }
}

/// Check a listing prefix. The empty prefix is valid.
pub fn is_valid_object_prefix(prefix: &str) -> bool {
    if prefix.len() > MAX_OBJECT_NAME_LEN {
        return false;
    }
    if has_bad_path_component(prefix) {
        return false;
    }
    !prefix.chars().any(|c| c == '\\' || c.is_ascii_control())
}

/// Validate an object key, returning [`S3Error::InvalidObjectName`] on failure.
pub fn validate_object_name(bucket: &str, object: &str) -> Result<(), S3Error> {
    if is_valid_object_name(object) {
        Ok(())
    } else {
        Err(S3Error::InvalidObjectName {
            bucket: bucket.to_string(),
            object: object.to_string(),
        })
    }
}

/// Whether any `/`-separated component is `.` or `..` (ignoring surrounding whitespace).
fn has_bad_path_component(path: &str) -> bool {
    path.trim()
        .split(SLASH_SEPARATOR)
        .map(str::trim)
        .any(|component| component == "." || component == "..")
}
