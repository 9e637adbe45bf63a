//! Remote volume filename codec.
//!
//! Every remote file's name encodes
//! `<prefix>-<type><guid>-<time>.<compression>[.<encryption>]`, where the
//! type is a single letter (`b` blocks, `i` index, `f` file-list), the guid
//! is 32 lowercase hex characters, and the time is compact UTC ISO-8601
//! (`YYYYMMDDTHHMMSSZ`). Parsing and generation are exact inverses; the
//! recreate engine depends on that to probe for renamed volumes.
//!
//! The prefix may contain dashes but not dots.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use super::VolumeKind;

const TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedVolumeName {
    pub prefix: String,
    pub kind: VolumeKind,
    pub guid: String,
    pub time: DateTime<Utc>,
    pub compression: String,
    pub encryption: Option<String>,
}

impl ParsedVolumeName {
    /// Regenerate the canonical filename, optionally with different codec
    /// modules (used by probing).
    pub fn with_modules(&self, compression: &str, encryption: Option<&str>) -> String {
        generate(
            &self.prefix,
            self.kind,
            &self.guid,
            self.time,
            compression,
            encryption,
        )
    }
}

/// Fresh 32-char lowercase hex volume guid.
pub fn new_guid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a fresh volume name using the configured codec modules.
pub fn generate_fresh(
    options: &crate::options::Options,
    kind: VolumeKind,
    time: DateTime<Utc>,
) -> String {
    generate(
        &options.prefix,
        kind,
        &new_guid(),
        time,
        &options.compression_module,
        options.encryption_module.as_deref(),
    )
}

pub fn generate(
    prefix: &str,
    kind: VolumeKind,
    guid: &str,
    time: DateTime<Utc>,
    compression: &str,
    encryption: Option<&str>,
) -> String {
    let mut name = format!(
        "{}-{}{}-{}.{}",
        prefix,
        kind.letter(),
        guid,
        time.format(TIME_FORMAT),
        compression
    );
    if let Some(enc) = encryption {
        name.push('.');
        name.push_str(enc);
    }
    name
}

/// Parse a filename regardless of prefix. Returns `None` for anything that
/// does not match the scheme.
pub fn parse(name: &str) -> Option<ParsedVolumeName> {
    let mut dot_parts = name.split('.');
    let base = dot_parts.next()?;
    let compression = dot_parts.next()?.to_string();
    let encryption = dot_parts.next().map(str::to_string);
    if dot_parts.next().is_some() || compression.is_empty() {
        return None;
    }
    if encryption.as_deref() == Some("") {
        return None;
    }

    let mut dash_parts: Vec<&str> = base.split('-').collect();
    if dash_parts.len() < 3 {
        return None;
    }
    let time_part = dash_parts.pop()?;
    let type_part = dash_parts.pop()?;
    let prefix = dash_parts.join("-");
    if prefix.is_empty() {
        return None;
    }

    let kind = VolumeKind::from_letter(type_part.chars().next()?)?;
    let guid = &type_part[1..];
    if guid.len() != 32 || !guid.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(time_part, TIME_FORMAT).ok()?;
    let time = Utc.from_utc_datetime(&naive);

    Some(ParsedVolumeName {
        prefix,
        kind,
        guid: guid.to_string(),
        time,
        compression,
        encryption,
    })
}

/// Parse a filename and require the configured prefix.
pub fn parse_with_prefix(name: &str, prefix: &str) -> Option<ParsedVolumeName> {
    parse(name).filter(|p| p.prefix == prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, 14, 30, 5).unwrap()
    }

    #[test]
    fn test_generate() {
        let name = generate(
            "coffer",
            VolumeKind::Blocks,
            "0123456789abcdef0123456789abcdef",
            sample_time(),
            "zip",
            None,
        );
        assert_eq!(
            name,
            "coffer-b0123456789abcdef0123456789abcdef-20260802T143005Z.zip"
        );

        let name = generate(
            "coffer",
            VolumeKind::Files,
            "0123456789abcdef0123456789abcdef",
            sample_time(),
            "zip",
            Some("aes"),
        );
        assert!(name.ends_with(".zip.aes"));
    }

    #[test]
    fn test_parse_generate_roundtrip() {
        // Every legal (type, prefix, guid, time, comp, enc) combination
        // must survive parse(generate(..)) unchanged.
        for kind in [VolumeKind::Blocks, VolumeKind::Index, VolumeKind::Files] {
            for prefix in ["coffer", "my-backup", "a"] {
                for enc in [None, Some("aes"), Some("gpg")] {
                    let guid = new_guid();
                    let name = generate(prefix, kind, &guid, sample_time(), "zip", enc);
                    let parsed = parse(&name).unwrap();
                    assert_eq!(parsed.prefix, prefix);
                    assert_eq!(parsed.kind, kind);
                    assert_eq!(parsed.guid, guid);
                    assert_eq!(parsed.time, sample_time());
                    assert_eq!(parsed.compression, "zip");
                    assert_eq!(parsed.encryption.as_deref(), enc);
                    assert_eq!(
                        parsed.with_modules("zip", enc),
                        name,
                        "generation must invert parsing"
                    );
                }
            }
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("").is_none());
        assert!(parse("README.md").is_none());
        assert!(parse("coffer-x0123456789abcdef0123456789abcdef-20260802T143005Z.zip").is_none());
        // Uppercase guid
        assert!(parse("coffer-bABCDEF6789abcdef0123456789abcdef-20260802T143005Z.zip").is_none());
        // Short guid
        assert!(parse("coffer-babc-20260802T143005Z.zip").is_none());
        // Bad timestamp
        assert!(parse("coffer-b0123456789abcdef0123456789abcdef-2026-08-02.zip").is_none());
        // No extension
        assert!(parse("coffer-b0123456789abcdef0123456789abcdef-20260802T143005Z").is_none());
        // Too many extensions
        assert!(
            parse("coffer-b0123456789abcdef0123456789abcdef-20260802T143005Z.zip.aes.gz").is_none()
        );
    }

    #[test]
    fn test_generate_fresh_uses_configured_modules() {
        let mut options = crate::options::Options::new("mine");
        options.encryption_module = Some("aes".to_string());
        let name = generate_fresh(&options, VolumeKind::Blocks, sample_time());
        let parsed = parse_with_prefix(&name, "mine").unwrap();
        assert_eq!(parsed.kind, VolumeKind::Blocks);
        assert_eq!(parsed.compression, "zip");
        assert_eq!(parsed.encryption.as_deref(), Some("aes"));
    }

    #[test]
    fn test_parse_with_prefix() {
        let guid = new_guid();
        let name = generate("mine", VolumeKind::Index, &guid, sample_time(), "zip", None);
        assert!(parse_with_prefix(&name, "mine").is_some());
        assert!(parse_with_prefix(&name, "other").is_none());
    }
}
