//! Staged copy report model and mutable report builder.

use std::collections::BTreeMap;
use std::fmt;

/// Outcome of one `copy_filesystem` run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReportCopy {
    /// Rendered `(source, target)` paths relative to each handle, in record order.
    pub pairs: Vec<(String, String)>,
    /// Items written to the staging directory.
    pub cnt_staged: u64,
    /// Items written to the target.
    pub cnt_committed: u64,
    /// Raw bytes moved during staging.
    pub bytes_staged: u64,
    /// Raw bytes moved during commit.
    pub bytes_committed: u64,
}

impl ReportCopy {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Machine-readable counters.
    pub fn to_dict(&self) -> BTreeMap<String, u64> {
        let mut dict_counts = BTreeMap::new();
        dict_counts.insert("cnt_pairs".to_string(), self.pairs.len() as u64);
        dict_counts.insert("cnt_staged".to_string(), self.cnt_staged);
        dict_counts.insert("cnt_committed".to_string(), self.cnt_committed);
        dict_counts.insert("bytes_staged".to_string(), self.bytes_staged);
        dict_counts.insert("bytes_committed".to_string(), self.bytes_committed);
        dict_counts
    }

    /// Human-readable one-line summary.
    pub fn format(&self, prefix: &str) -> String {
        let dict_counts = self.to_dict();
        format!(
            "{prefix} pairs={} staged={} committed={} bytes_staged={} bytes_committed={}",
            dict_counts["cnt_pairs"],
            dict_counts["cnt_staged"],
            dict_counts["cnt_committed"],
            dict_counts["bytes_staged"],
            dict_counts["bytes_committed"]
        )
    }
}

impl fmt::Display for ReportCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format("[COPY]"))
    }
}

/// Mutable accumulator for copy statistics.
#[derive(Debug, Default, Clone)]
pub struct ReportCopyBuilder {
    pub pairs: Vec<(String, String)>,
    pub cnt_staged: u64,
    pub cnt_committed: u64,
    pub bytes_staged: u64,
    pub bytes_committed: u64,
}

impl ReportCopyBuilder {
    pub fn add_staged(&mut self, n_bytes: u64) {
        self.cnt_staged += 1;
        self.bytes_staged += n_bytes;
    }

    /// Record one committed item and its rendered path pair.
    pub fn add_committed(&mut self, path_source: String, path_target: String, n_bytes: u64) {
        self.cnt_committed += 1;
        self.bytes_committed += n_bytes;
        self.pairs.push((path_source, path_target));
    }

    /// Finalize builder into immutable report.
    pub fn build(self) -> ReportCopy {
        ReportCopy {
            pairs: self.pairs,
            cnt_staged: self.cnt_staged,
            cnt_committed: self.cnt_committed,
            bytes_staged: self.bytes_staged,
            bytes_committed: self.bytes_committed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ReportCopy, ReportCopyBuilder};

    #[test]
    fn report_copy_to_dict_and_format() {
        let mut builder = ReportCopyBuilder::default();
        builder.add_staged(10);
        builder.add_staged(5);
        builder.add_committed("s://a".to_string(), "t://a".to_string(), 10);
        let report = builder.build();

        let dict_counts = report.to_dict();
        assert_eq!(dict_counts["cnt_pairs"], 1);
        assert_eq!(dict_counts["cnt_staged"], 2);
        assert_eq!(dict_counts["bytes_staged"], 15);
        assert_eq!(dict_counts["bytes_committed"], 10);

        let txt = report.format("[COPY]");
        assert_eq!(
            txt,
            "[COPY] pairs=1 staged=2 committed=1 bytes_staged=15 bytes_committed=10"
        );
        assert_eq!(report.to_string(), txt);
        assert!(ReportCopy::default().is_empty());
    }
}
