//! Compact decision rules over the wasted-space report.

use super::wasted::VolumeUsage;

/// Tuning inputs for the compact decision.
#[derive(Clone, Copy, Debug)]
pub struct CompactThresholds {
    pub volsize: i64,
    /// Percent of waste that makes a volume (or the whole set) worth
    /// rewriting.
    pub waste_threshold: i64,
    pub small_file_size: i64,
    pub max_small_file_count: i64,
}

#[derive(Debug)]
pub struct CompactReport {
    /// Volumes where every live byte is actually dead; deletable without
    /// rewriting anything.
    cleanable: Vec<VolumeUsage>,
    /// Volumes above the waste threshold, oldest first.
    wasted: Vec<VolumeUsage>,
    /// Volumes small enough to be merge candidates, oldest first.
    small: Vec<VolumeUsage>,
    total_data: i64,
    total_wasted: i64,
    thresholds: CompactThresholds,
}

impl CompactReport {
    /// Classify a wasted-space report (already ordered oldest-first).
    pub fn new(usage: Vec<VolumeUsage>, thresholds: CompactThresholds) -> Self {
        let total_data: i64 = usage.iter().map(|u| u.data_size()).sum();
        let total_wasted: i64 = usage.iter().map(|u| u.wasted_size()).sum();

        let mut cleanable = Vec::new();
        let mut wasted = Vec::new();
        let mut small = Vec::new();
        for volume in usage {
            if volume.data_size() <= volume.wasted_size() {
                cleanable.push(volume);
                continue;
            }
            let wasted_enough = volume.wasted_size() * 100
                >= thresholds.waste_threshold * volume.data_size()
                || volume.wasted_size() * 100 >= thresholds.waste_threshold * thresholds.volsize;
            if wasted_enough {
                wasted.push(volume.clone());
            }
            if volume.compressed_size <= thresholds.small_file_size {
                small.push(volume);
            }
        }

        Self {
            cleanable,
            wasted,
            small,
            total_data,
            total_wasted,
            thresholds,
        }
    }

    /// True when fully-dead volumes exist and can be reclaimed outright.
    pub fn should_reclaim(&self) -> bool {
        !self.cleanable.is_empty()
    }

    /// Overall waste across all readable block volumes, in percent.
    pub fn waste_percentage(&self) -> i64 {
        if self.total_data == 0 {
            0
        } else {
            self.total_wasted * 100 / self.total_data
        }
    }

    /// True when rewriting is warranted: enough aggregate waste spread
    /// over at least two volumes, or too many / too much small-volume
    /// overhead.
    pub fn should_compact(&self) -> bool {
        let small_total: i64 = self.small.iter().map(|u| u.compressed_size).sum();
        (self.waste_percentage() >= self.thresholds.waste_threshold && self.wasted.len() >= 2)
            || small_total > self.thresholds.volsize
            || self.small.len() as i64 > self.thresholds.max_small_file_count
    }

    pub fn cleanable_volumes(&self) -> &[VolumeUsage] {
        &self.cleanable
    }

    /// Waste ∪ small, distinct, preserving the oldest-first order of the
    /// waste set.
    pub fn compactable_volumes(&self) -> Vec<&VolumeUsage> {
        let mut out: Vec<&VolumeUsage> = self.wasted.iter().collect();
        for volume in &self.small {
            if !out.iter().any(|v| v.volume_id == volume.volume_id) {
                out.push(volume);
            }
        }
        out
    }

    /// One-line decision summary for the operation log.
    pub fn describe(&self) -> String {
        format!(
            "waste {}% over {} volumes ({} fully dead, {} wasted, {} small): reclaim={} compact={}",
            self.waste_percentage(),
            self.cleanable.len() + self.wasted.len() + self.small.len(),
            self.cleanable.len(),
            self.wasted.len(),
            self.small.len(),
            self.should_reclaim(),
            self.should_compact()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(id: i64, active: i64, inactive: i64, compressed: i64, sort_time: i64) -> VolumeUsage {
        VolumeUsage {
            volume_id: id,
            name: format!("vol-{}", id),
            active_size: active,
            inactive_size: inactive,
            compressed_size: compressed,
            sort_time,
        }
    }

    const GIB: i64 = 1024 * 1024 * 1024;
    const MIB: i64 = 1024 * 1024;

    fn thresholds() -> CompactThresholds {
        CompactThresholds {
            volsize: GIB,
            waste_threshold: 25,
            small_file_size: 20 * MIB,
            max_small_file_count: 10,
        }
    }

    #[test]
    fn test_small_count_rule() {
        // Twelve small volumes of 5 MiB with 5% waste each: compact due to
        // the small-count rule, nothing to reclaim.
        let usage: Vec<_> = (0..12)
            .map(|i| usage(i, 95 * MIB / 10, 5 * MIB / 10, 5 * MIB, i))
            .collect();
        let report = CompactReport::new(usage, thresholds());

        assert!(!report.should_reclaim());
        assert!(report.should_compact());
        assert_eq!(report.compactable_volumes().len(), 12);
    }

    #[test]
    fn test_fully_dead_volume_reclaims() {
        let report = CompactReport::new(
            vec![usage(1, 0, 500, 400, 10), usage(2, 1000, 10, 900, 20)],
            thresholds(),
        );
        assert!(report.should_reclaim());
        assert_eq!(report.cleanable_volumes().len(), 1);
        assert_eq!(report.cleanable_volumes()[0].volume_id, 1);
        // The dead volume is excluded from the compactable sets.
        assert!(report
            .compactable_volumes()
            .iter()
            .all(|v| v.volume_id != 1));
    }

    #[test]
    fn test_waste_rule_needs_two_volumes() {
        // One volume with 50% waste: above threshold but alone, and small
        // rules not triggered (file too big).
        let report = CompactReport::new(vec![usage(1, 500 * MIB, 500 * MIB, 800 * MIB, 1)], thresholds());
        assert!(!report.should_compact());

        // Two such volumes tip the rule.
        let report = CompactReport::new(
            vec![
                usage(1, 500 * MIB, 500 * MIB, 800 * MIB, 1),
                usage(2, 500 * MIB, 500 * MIB, 800 * MIB, 2),
            ],
            thresholds(),
        );
        assert!(report.should_compact());
    }

    #[test]
    fn test_small_total_rule() {
        // Few small volumes, but together they exceed one volsize.
        let few_big_smalls: Vec<_> = (0..3)
            .map(|i| {
                let mut u = usage(i, 400 * MIB, 0, 400 * MIB, i);
                u.compressed_size = 400 * MIB;
                u
            })
            .collect();
        let mut t = thresholds();
        t.small_file_size = 500 * MIB;
        let report = CompactReport::new(few_big_smalls, t);
        assert!(report.should_compact());
    }

    #[test]
    fn test_compactable_order_waste_first() {
        // A volume in both sets appears once, in waste order.
        let both = usage(1, 100, 100, 10 * MIB, 5); // 50% waste AND small
        let only_small = usage(2, 1000, 0, 10 * MIB, 1);
        let report = CompactReport::new(vec![only_small, both], thresholds());

        let ids: Vec<i64> = report.compactable_volumes().iter().map(|v| v.volume_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_empty_report() {
        let report = CompactReport::new(Vec::new(), thresholds());
        assert!(!report.should_reclaim());
        assert!(!report.should_compact());
        assert_eq!(report.waste_percentage(), 0);
        assert!(report.compactable_volumes().is_empty());
    }
}
