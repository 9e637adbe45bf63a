//! Retention policy evaluation.
//!
//! Four independent removers produce candidate sets which are unioned and
//! deduplicated; a final safety rule guarantees at least one fileset
//! survives unless full removal was explicitly allowed.

use crate::error::{EngineError, Result};

use super::FilesetVersion;

/// One `timeframe:interval` pair. `timeframe == None` means unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionRule {
    pub timeframe: Option<i64>,
    pub interval: i64,
}

fn parse_duration(s: &str) -> Option<i64> {
    let s = s.trim();
    let (digits, suffix) = s.split_at(s.len().saturating_sub(1));
    let (value, unit): (&str, i64) = match suffix {
        "s" => (digits, 1),
        "m" => (digits, 60),
        "h" => (digits, 60 * 60),
        "D" => (digits, 24 * 60 * 60),
        "W" => (digits, 7 * 24 * 60 * 60),
        "M" => (digits, 30 * 24 * 60 * 60),
        "Y" => (digits, 365 * 24 * 60 * 60),
        // No suffix: plain seconds.
        _ => (s, 1),
    };
    value.parse::<i64>().ok().map(|v| v * unit)
}

impl RetentionRule {
    /// Parse the `"1D:0s,1W:1D,U:1M"` form: a comma-separated list of
    /// `timeframe:interval` pairs, `U` being the unbounded timeframe.
    pub fn parse_list(input: &str) -> Result<Vec<RetentionRule>> {
        let mut rules = Vec::new();
        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (frame, interval) = part.split_once(':').ok_or_else(|| {
                EngineError::user(
                    crate::error::ids::INVALID_RETENTION_POLICY,
                    format!("retention rule '{}' is not of the form timeframe:interval", part),
                )
            })?;
            let timeframe = if frame.eq_ignore_ascii_case("U") {
                None
            } else {
                Some(parse_duration(frame).ok_or_else(|| {
                    EngineError::user(
                        crate::error::ids::INVALID_RETENTION_POLICY,
                        format!("cannot parse retention timeframe '{}'", frame),
                    )
                })?)
            };
            let interval = parse_duration(interval).ok_or_else(|| {
                EngineError::user(
                    crate::error::ids::INVALID_RETENTION_POLICY,
                    format!("cannot parse retention interval '{}'", interval),
                )
            })?;
            rules.push(RetentionRule { timeframe, interval });
        }
        Ok(rules)
    }
}

/// Everything the policy evaluation needs besides the fileset list.
#[derive(Clone, Debug, Default)]
pub struct RetentionPlan {
    /// User-selected backup versions to delete outright.
    pub explicit_versions: Vec<usize>,
    /// Delete backups older than this unix timestamp.
    pub keep_time_cutoff: Option<i64>,
    /// Keep this many full backups.
    pub keep_versions: Option<usize>,
    pub rules: Vec<RetentionRule>,
    pub allow_full_removal: bool,
}

impl RetentionPlan {
    /// A plan carrying the configured schedule rules; the one-shot
    /// removers (explicit versions, cutoffs) are request-scoped and stay
    /// empty here.
    pub fn from_options(options: &crate::options::Options) -> Self {
        Self {
            rules: options.retention_rules.clone(),
            allow_full_removal: options.allow_full_removal,
            ..Default::default()
        }
    }
}

fn sorted_desc(filesets: &[FilesetVersion]) -> Vec<FilesetVersion> {
    let mut sorted = filesets.to_vec();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.version.cmp(&a.version)));
    sorted
}

/// Remover 1: filesets whose user-visible version index was listed.
pub fn explicit_version_remover(
    filesets: &[FilesetVersion],
    versions: &[usize],
) -> Vec<FilesetVersion> {
    filesets
        .iter()
        .filter(|f| versions.contains(&f.version))
        .cloned()
        .collect()
}

/// Remover 2: delete backups older than the cutoff, but never skip past
/// the cutoff before at least one full backup has been retained.
pub fn keep_time_remover(filesets: &[FilesetVersion], cutoff: i64) -> Vec<FilesetVersion> {
    let sorted = sorted_desc(filesets);
    let mut seen_full = false;
    let mut boundary = sorted.len();
    for (i, fileset) in sorted.iter().enumerate() {
        if fileset.timestamp >= cutoff || !seen_full {
            if fileset.is_full_backup {
                seen_full = true;
            }
        } else {
            boundary = i;
            break;
        }
    }
    sorted[boundary..].to_vec()
}

/// Remover 3: keep the newest `n` full backups and every partial newer
/// than the oldest of them; everything older is deletable.
pub fn keep_versions_remover(filesets: &[FilesetVersion], n: usize) -> Vec<FilesetVersion> {
    if n == 0 {
        return Vec::new();
    }
    let sorted = sorted_desc(filesets);
    let mut fulls = 0usize;
    for (i, fileset) in sorted.iter().enumerate() {
        if fileset.is_full_backup {
            fulls += 1;
            if fulls == n {
                return sorted[i + 1..].to_vec();
            }
        }
    }
    // Fewer than n full backups: nothing is deletable.
    Vec::new()
}

/// Remover 4: bucketed thinning. Timeframes are processed smallest first;
/// within a timeframe backups are visited newest-first and a full backup
/// is kept only when it is more than `interval` older than the last kept
/// full. Partials inside a timeframe are always kept. Backups older than
/// every timeframe are deletable. The newest backup is provisionally kept
/// and may only be deleted when `allow_full_removal` and it falls outside
/// every timeframe.
pub fn retention_policy_remover(
    filesets: &[FilesetVersion],
    rules: &[RetentionRule],
    allow_full_removal: bool,
    now: i64,
) -> Vec<FilesetVersion> {
    if filesets.is_empty() || rules.is_empty() {
        return Vec::new();
    }
    let sorted = sorted_desc(filesets);

    let mut rules = rules.to_vec();
    rules.sort_by_key(|r| r.timeframe.unwrap_or(i64::MAX));

    let newest = &sorted[0];
    let mut last_kept: Option<i64> = newest.is_full_backup.then_some(newest.timestamp);

    let mut deletable = Vec::new();
    let mut remaining = &sorted[1..];
    for rule in &rules {
        let frame_start = match rule.timeframe {
            Some(frame) => now - frame,
            None => i64::MIN,
        };
        let in_frame = remaining
            .iter()
            .take_while(|f| f.timestamp >= frame_start)
            .count();
        for fileset in &remaining[..in_frame] {
            if !fileset.is_full_backup {
                continue;
            }
            let keep = match last_kept {
                None => true,
                Some(kept_time) => kept_time - fileset.timestamp > rule.interval,
            };
            if keep {
                last_kept = Some(fileset.timestamp);
            } else {
                deletable.push(fileset.clone());
            }
        }
        remaining = &remaining[in_frame..];
    }

    // Older than every timeframe.
    deletable.extend(remaining.iter().cloned());

    if allow_full_removal {
        let outside_all = rules
            .iter()
            .all(|r| matches!(r.timeframe, Some(f) if newest.timestamp < now - f));
        if outside_all {
            deletable.push(newest.clone());
        }
    }
    deletable
}

/// Union the four removers, dedup by version, and apply the last-survivor
/// safety rule.
pub fn evaluate(
    filesets: &[FilesetVersion],
    plan: &RetentionPlan,
    now: i64,
) -> Vec<FilesetVersion> {
    let mut deletable: Vec<FilesetVersion> = Vec::new();
    let mut push_all = |set: Vec<FilesetVersion>| {
        for fileset in set {
            if !deletable.iter().any(|d| d.version == fileset.version) {
                deletable.push(fileset);
            }
        }
    };

    push_all(explicit_version_remover(filesets, &plan.explicit_versions));
    if let Some(cutoff) = plan.keep_time_cutoff {
        push_all(keep_time_remover(filesets, cutoff));
    }
    if let Some(n) = plan.keep_versions {
        push_all(keep_versions_remover(filesets, n));
    }
    if !plan.rules.is_empty() {
        push_all(retention_policy_remover(
            filesets,
            &plan.rules,
            plan.allow_full_removal,
            now,
        ));
    }

    if deletable.len() == filesets.len() && !filesets.is_empty() && !plan.allow_full_removal {
        // Keep the oldest entry so at least one fileset survives.
        let oldest_version = deletable
            .iter()
            .min_by_key(|f| f.timestamp)
            .map(|f| f.version);
        if let Some(version) = oldest_version {
            deletable.retain(|f| f.version != version);
        }
    }
    deletable.sort_by_key(|f| f.version);
    deletable
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3600;
    const DAY: i64 = 24 * HOUR;
    const NOW: i64 = 1_800_000_000;

    fn filesets(specs: &[(i64, bool)]) -> Vec<FilesetVersion> {
        // specs: (age in seconds, is_full), newest first
        specs
            .iter()
            .enumerate()
            .map(|(i, (age, full))| FilesetVersion {
                version: i,
                fileset_id: i as i64 + 1,
                timestamp: NOW - age,
                is_full_backup: *full,
            })
            .collect()
    }

    fn surviving_ages(all: &[FilesetVersion], deletable: &[FilesetVersion]) -> Vec<i64> {
        all.iter()
            .filter(|f| !deletable.iter().any(|d| d.version == f.version))
            .map(|f| NOW - f.timestamp)
            .collect()
    }

    #[test]
    fn test_explicit_versions() {
        let all = filesets(&[(0, true), (DAY, true), (2 * DAY, true)]);
        let deletable = explicit_version_remover(&all, &[1]);
        assert_eq!(deletable.len(), 1);
        assert_eq!(deletable[0].version, 1);
    }

    #[test]
    fn test_keep_time_basic() {
        let all = filesets(&[(0, true), (DAY, true), (10 * DAY, true)]);
        let deletable = keep_time_remover(&all, NOW - 2 * DAY);
        assert_eq!(deletable.len(), 1);
        assert_eq!(NOW - deletable[0].timestamp, 10 * DAY);
    }

    #[test]
    fn test_keep_time_retains_a_full_backup() {
        // Only partials inside the cutoff; the old full must survive.
        let all = filesets(&[(0, false), (DAY, false), (10 * DAY, true), (20 * DAY, true)]);
        let deletable = keep_time_remover(&all, NOW - 2 * DAY);
        let survivors = surviving_ages(&all, &deletable);
        assert!(survivors.contains(&(10 * DAY)), "first full must be kept");
        assert_eq!(deletable.len(), 1);
        assert_eq!(NOW - deletable[0].timestamp, 20 * DAY);
    }

    #[test]
    fn test_keep_versions_counts_fulls() {
        let all = filesets(&[
            (0, false),       // leading partial
            (DAY, true),      // full 1
            (2 * DAY, false), // partial between fulls
            (3 * DAY, true),  // full 2
            (4 * DAY, true),  // full 3 - deletable
            (5 * DAY, false), // old partial - deletable
        ]);
        let deletable = keep_versions_remover(&all, 2);
        let survivors = surviving_ages(&all, &deletable);
        // min(2, 3) fulls plus all partials between/above them.
        assert_eq!(survivors, vec![0, DAY, 2 * DAY, 3 * DAY]);
    }

    #[test]
    fn test_keep_versions_fewer_fulls_than_n() {
        let all = filesets(&[(0, false), (DAY, true), (2 * DAY, false)]);
        assert!(keep_versions_remover(&all, 5).is_empty());
    }

    #[test]
    fn test_retention_policy_schedule() {
        // Backups at now-{0h,1h,2h,1d,2d,7d,30d,60d}, all full, policy
        // [(1d,0), (7d,1d), (30d,7d), (unbounded,30d)].
        let all = filesets(&[
            (0, true),
            (HOUR, true),
            (2 * HOUR, true),
            (DAY, true),
            (2 * DAY, true),
            (7 * DAY, true),
            (30 * DAY, true),
            (60 * DAY, true),
        ]);
        let rules = vec![
            RetentionRule { timeframe: Some(DAY), interval: 0 },
            RetentionRule { timeframe: Some(7 * DAY), interval: DAY },
            RetentionRule { timeframe: Some(30 * DAY), interval: 7 * DAY },
            RetentionRule { timeframe: None, interval: 30 * DAY },
        ];
        let deletable = retention_policy_remover(&all, &rules, false, NOW);
        let mut survivors = surviving_ages(&all, &deletable);
        survivors.sort();
        assert_eq!(survivors, vec![0, HOUR, 2 * HOUR, DAY, 7 * DAY, 30 * DAY]);
    }

    #[test]
    fn test_retention_policy_input_order_independent() {
        let all = filesets(&[
            (0, true),
            (HOUR, true),
            (DAY, true),
            (2 * DAY, true),
            (7 * DAY, true),
        ]);
        let rules = vec![
            RetentionRule { timeframe: Some(DAY), interval: 0 },
            RetentionRule { timeframe: None, interval: 3 * DAY },
        ];
        // Shuffled input and shuffled rules must give the same result.
        let mut scrambled = all.clone();
        scrambled.reverse();
        scrambled.swap(0, 2);
        let mut scrambled_rules = rules.clone();
        scrambled_rules.reverse();

        let a: Vec<usize> = retention_policy_remover(&all, &rules, false, NOW)
            .iter()
            .map(|f| f.version)
            .collect();
        let b: Vec<usize> = retention_policy_remover(&scrambled, &scrambled_rules, false, NOW)
            .iter()
            .map(|f| f.version)
            .collect();
        let (mut a, mut b) = (a, b);
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_retention_policy_partials_kept_in_frames() {
        let all = filesets(&[
            (0, true),
            (HOUR, false),     // partial inside 1d frame
            (2 * HOUR, true),  // full, interval 0 keeps it
            (3 * DAY, false),  // partial inside unbounded frame
        ]);
        let rules = vec![
            RetentionRule { timeframe: Some(DAY), interval: 0 },
            RetentionRule { timeframe: None, interval: 10 * DAY },
        ];
        let deletable = retention_policy_remover(&all, &rules, false, NOW);
        // Partials never enter the delete set via this remover.
        assert!(deletable.iter().all(|f| f.is_full_backup));
    }

    #[test]
    fn test_evaluate_union_and_safety() {
        let all = filesets(&[(0, true), (DAY, true), (2 * DAY, true)]);
        // Every remover together would delete everything.
        let plan = RetentionPlan {
            explicit_versions: vec![0, 1, 2],
            keep_time_cutoff: Some(NOW + 1),
            keep_versions: None,
            rules: Vec::new(),
            allow_full_removal: false,
        };
        let deletable = evaluate(&all, &plan, NOW);
        // The oldest entry is dropped from the delete set.
        assert_eq!(deletable.len(), 2);
        assert!(deletable.iter().all(|f| NOW - f.timestamp != 2 * DAY));
    }

    #[test]
    fn test_evaluate_full_removal_allowed() {
        let all = filesets(&[(0, true), (DAY, true)]);
        let plan = RetentionPlan {
            explicit_versions: vec![0, 1],
            allow_full_removal: true,
            ..Default::default()
        };
        let deletable = evaluate(&all, &plan, NOW);
        assert_eq!(deletable.len(), 2);
    }

    #[test]
    fn test_evaluate_dedups_versions() {
        let all = filesets(&[(0, true), (DAY, true), (10 * DAY, true)]);
        let plan = RetentionPlan {
            explicit_versions: vec![2],
            keep_time_cutoff: Some(NOW - 2 * DAY),
            ..Default::default()
        };
        let deletable = evaluate(&all, &plan, NOW);
        assert_eq!(deletable.len(), 1);
        assert_eq!(deletable[0].version, 2);
    }

    #[test]
    fn test_rule_parsing() {
        let rules = RetentionRule::parse_list("1D:0s,1W:1D,U:1M").unwrap();
        assert_eq!(
            rules,
            vec![
                RetentionRule { timeframe: Some(DAY), interval: 0 },
                RetentionRule { timeframe: Some(7 * DAY), interval: DAY },
                RetentionRule { timeframe: None, interval: 30 * DAY },
            ]
        );
        assert!(RetentionRule::parse_list("nonsense").is_err());
        assert!(RetentionRule::parse_list("1D").is_err());
        assert!(RetentionRule::parse_list("").unwrap().is_empty());
    }
}
