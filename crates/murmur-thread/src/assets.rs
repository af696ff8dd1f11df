//! Per-thread registry of image artifacts, used to resolve follow-up
//! references ("edit it", "that image") without replaying full history.

use murmur_ai::ImageSource;

/// How an artifact entered the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSource {
    Generated,
    Uploaded,
    Edited,
}

impl AssetSource {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetSource::Generated => "generated",
            AssetSource::Uploaded => "uploaded",
            AssetSource::Edited => "edited",
        }
    }
}

/// Image payload, either inline or by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetData {
    Base64 { mime_type: String, data: String },
    Url(String),
}

impl AssetData {
    pub fn as_image_source(&self) -> ImageSource {
        match self {
            AssetData::Base64 { mime_type, data } => ImageSource::Base64 {
                mime_type: mime_type.clone(),
                data: data.clone(),
            },
            AssetData::Url(url) => ImageSource::Url { url: url.clone() },
        }
    }
}

/// One tracked image artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRecord {
    pub data: AssetData,
    pub prompt: String,
    pub timestamp_ms: u64,
    pub source: AssetSource,
    pub analysis: Option<String>,
}

/// A thread's image artifacts in creation order.
#[derive(Debug, Clone, Default)]
pub struct AssetLedger {
    records: Vec<AssetRecord>,
}

impl AssetLedger {
    pub fn record(&mut self, record: AssetRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[AssetRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent artifact; the default referent for "the image".
    pub fn latest(&self) -> Option<&AssetRecord> {
        self.records.last()
    }

    /// Most recent artifact whose prompt or analysis mentions `reference`.
    /// An empty reference falls back to the most recent artifact.
    pub fn latest_matching(&self, reference: &str) -> Option<&AssetRecord> {
        let needle = reference.trim().to_lowercase();
        if needle.is_empty() {
            return self.latest();
        }
        self.records.iter().rev().find(|record| {
            record.prompt.to_lowercase().contains(&needle)
                || record
                    .analysis
                    .as_deref()
                    .map(|analysis| analysis.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{AssetData, AssetLedger, AssetRecord, AssetSource};

    fn record(prompt: &str, analysis: Option<&str>, timestamp_ms: u64) -> AssetRecord {
        AssetRecord {
            data: AssetData::Url(format!("https://files.example.com/{timestamp_ms}")),
            prompt: prompt.to_string(),
            timestamp_ms,
            source: AssetSource::Generated,
            analysis: analysis.map(str::to_string),
        }
    }

    #[test]
    fn unit_latest_returns_most_recent_record() {
        let mut ledger = AssetLedger::default();
        ledger.record(record("a red fox", None, 1));
        ledger.record(record("a blue heron", None, 2));
        assert_eq!(ledger.len(), 2);
        assert_eq!(
            ledger.latest().map(|r| r.prompt.as_str()),
            Some("a blue heron")
        );
    }

    #[test]
    fn functional_latest_matching_searches_prompt_and_analysis() {
        let mut ledger = AssetLedger::default();
        ledger.record(record("a red fox", None, 1));
        ledger.record(record("city skyline", Some("photo of trams and rain"), 2));
        ledger.record(record("a fox again", None, 3));

        assert_eq!(
            ledger.latest_matching("fox").map(|r| r.timestamp_ms),
            Some(3)
        );
        assert_eq!(
            ledger.latest_matching("trams").map(|r| r.timestamp_ms),
            Some(2)
        );
        assert_eq!(ledger.latest_matching("").map(|r| r.timestamp_ms), Some(3));
        assert!(ledger.latest_matching("submarine").is_none());
    }
}
