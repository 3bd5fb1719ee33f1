//! Vendor flat-file parsing and immutable feed snapshots for CRIS.
//!
//! The distributor ships inventory as a semicolon-delimited text file with a
//! fixed column layout. One versioned [`FeedSchema`] owns the field offsets;
//! every consumer goes through the same parser instead of hand-coding
//! indices.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use cris_core::pricing::parse_money;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cris-feed";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing feed schema: {0}")]
    Schema(#[from] serde_yaml::Error),
}

/// Versioned field-offset descriptor for the distributor inventory file.
///
/// Revision 1 read MAP from offset 62; the current revision reads offset 70,
/// which is what the distributor's own documentation and the production feed
/// processor agree on. Old archived snapshots can still be replayed with
/// [`FeedSchema::revision_1`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSchema {
    pub revision: u32,
    pub min_fields: usize,
    pub stock_number: usize,
    pub upc: usize,
    pub description: usize,
    pub department: usize,
    pub manufacturer_id: usize,
    pub msrp: usize,
    pub wholesale: usize,
    pub weight: usize,
    pub quantity: usize,
    pub model: usize,
    pub manufacturer_name: usize,
    pub manufacturer_part_number: usize,
    pub allocation: usize,
    pub expanded_description: usize,
    pub image_name: usize,
    pub drop_ship_block: usize,
    pub map_price: usize,
}

impl FeedSchema {
    pub fn current() -> Self {
        Self {
            revision: 2,
            min_fields: 77,
            stock_number: 0,
            upc: 1,
            description: 2,
            department: 3,
            manufacturer_id: 4,
            msrp: 5,
            wholesale: 6,
            weight: 7,
            quantity: 8,
            model: 9,
            manufacturer_name: 10,
            manufacturer_part_number: 11,
            allocation: 12,
            expanded_description: 13,
            image_name: 14,
            drop_ship_block: 68,
            map_price: 70,
        }
    }

    /// Superseded layout kept only for replaying snapshots archived before
    /// the MAP offset correction.
    pub fn revision_1() -> Self {
        Self {
            revision: 1,
            map_price: 62,
            ..Self::current()
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, FeedError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).await.map_err(|source| FeedError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }
}

impl Default for FeedSchema {
    fn default() -> Self {
        Self::current()
    }
}

/// One parsed line of the distributor inventory export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedLine {
    pub stock_number: String,
    pub upc: String,
    pub description: String,
    pub department: String,
    pub manufacturer_id: String,
    pub msrp: Option<f64>,
    pub wholesale: Option<f64>,
    pub weight: Option<f64>,
    pub quantity: u32,
    pub model: String,
    pub manufacturer_name: String,
    pub manufacturer_part_number: String,
    pub allocation: String,
    pub expanded_description: String,
    pub image_name: String,
    pub drop_ship_blocked: bool,
    pub map_price: Option<f64>,
}

impl FeedLine {
    pub fn in_stock(&self) -> bool {
        self.quantity > 0
    }
}

/// Why a raw line did not make it into the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineSkip {
    Blank,
    TooFewFields,
    NoStockNumber,
}

fn parse_line(schema: &FeedSchema, line: &str) -> Result<FeedLine, LineSkip> {
    if line.trim().is_empty() {
        return Err(LineSkip::Blank);
    }
    let fields: Vec<&str> = line.split(';').collect();
    if fields.len() < schema.min_fields {
        return Err(LineSkip::TooFewFields);
    }
    let text = |idx: usize| fields.get(idx).map(|f| f.trim().to_string()).unwrap_or_default();
    let price = |idx: usize| fields.get(idx).and_then(|f| parse_money(f));

    let stock_number = text(schema.stock_number);
    if stock_number.is_empty() {
        return Err(LineSkip::NoStockNumber);
    }

    Ok(FeedLine {
        stock_number,
        upc: text(schema.upc),
        description: text(schema.description),
        department: text(schema.department),
        manufacturer_id: text(schema.manufacturer_id),
        msrp: price(schema.msrp),
        wholesale: price(schema.wholesale),
        weight: fields
            .get(schema.weight)
            .and_then(|f| f.trim().parse::<f64>().ok())
            .filter(|w| *w > 0.0),
        quantity: fields
            .get(schema.quantity)
            .and_then(|f| f.trim().parse::<u32>().ok())
            .unwrap_or(0),
        model: text(schema.model),
        manufacturer_name: text(schema.manufacturer_name),
        manufacturer_part_number: text(schema.manufacturer_part_number),
        allocation: text(schema.allocation),
        expanded_description: text(schema.expanded_description),
        image_name: text(schema.image_name),
        drop_ship_blocked: !text(schema.drop_ship_block).is_empty(),
        map_price: price(schema.map_price),
    })
}

/// Parse accounting; short and blank lines are counted, never silently lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub total_lines: usize,
    pub parsed: usize,
    pub skipped_blank: usize,
    pub skipped_short: usize,
    pub skipped_no_stock_number: usize,
    pub duplicate_stock_numbers: usize,
}

/// The whole feed held in memory, keyed by distributor stock number.
///
/// The file is always parsed wholesale; when the same stock number appears
/// twice the later line wins, matching how the distributor publishes
/// corrections.
#[derive(Debug)]
pub struct FeedIndex {
    schema: FeedSchema,
    by_stock_number: HashMap<String, FeedLine>,
    stats: FeedStats,
}

impl FeedIndex {
    pub fn parse(schema: FeedSchema, text: &str) -> Self {
        let mut by_stock_number = HashMap::new();
        let mut stats = FeedStats::default();
        for line in text.lines() {
            stats.total_lines += 1;
            match parse_line(&schema, line) {
                Ok(parsed) => {
                    stats.parsed += 1;
                    if by_stock_number
                        .insert(parsed.stock_number.clone(), parsed)
                        .is_some()
                    {
                        stats.duplicate_stock_numbers += 1;
                    }
                }
                Err(LineSkip::Blank) => stats.skipped_blank += 1,
                Err(LineSkip::TooFewFields) => stats.skipped_short += 1,
                Err(LineSkip::NoStockNumber) => stats.skipped_no_stock_number += 1,
            }
        }
        info!(
            total = stats.total_lines,
            parsed = stats.parsed,
            short = stats.skipped_short,
            "parsed vendor feed"
        );
        Self {
            schema,
            by_stock_number,
            stats,
        }
    }

    pub async fn load(schema: FeedSchema, path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).await.map_err(|source| FeedError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(schema, &text))
    }

    pub fn get(&self, stock_number: &str) -> Option<&FeedLine> {
        self.by_stock_number.get(stock_number)
    }

    pub fn len(&self) -> usize {
        self.by_stock_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_stock_number.is_empty()
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }

    pub fn schema(&self) -> &FeedSchema {
        &self.schema
    }
}

#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of raw feed files as delivered.
///
/// Re-archiving identical bytes is a no-op; the snapshot path embeds the
/// delivery date and content hash so a run can always be traced back to the
/// exact file it read.
#[derive(Debug, Clone)]
pub struct FeedArchive {
    root: PathBuf,
}

impl FeedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn snapshot_relative_path(delivered_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        let stamp = delivered_at.format("%Y%m%d").to_string();
        PathBuf::from(stamp).join(format!("{content_hash}.txt"))
    }

    /// Store raw feed bytes under a hash-addressed path with an atomic
    /// temp-file rename, deduplicating on content.
    pub async fn store_snapshot(
        &self,
        delivered_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<FeedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::snapshot_relative_path(delivered_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(FeedSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = absolute_path
            .parent()
            .expect("snapshot path always has parent")
            .join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(FeedSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(FeedSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// A minimal but layout-faithful line: 77 fields with the interesting
    /// offsets populated.
    fn sample_line(stock: &str, dept: &str, mpn: &str, map: &str) -> String {
        let mut fields = vec![String::new(); 77];
        fields[0] = stock.to_string();
        fields[1] = "812345678901".to_string();
        fields[2] = "GLOCK 19 GEN5 9MM 15RD".to_string();
        fields[3] = dept.to_string();
        fields[4] = "GLOCK".to_string();
        fields[5] = "599.00".to_string();
        fields[6] = "430.00".to_string();
        fields[7] = "1.85".to_string();
        fields[8] = "12".to_string();
        fields[9] = "PA195S203".to_string();
        fields[10] = "Glock Inc".to_string();
        fields[11] = mpn.to_string();
        fields[70] = map.to_string();
        fields.join(";")
    }

    #[test]
    fn short_lines_are_skipped_and_counted() {
        let text = format!(
            "{}\nRSR999;too;short\n\n{}",
            sample_line("RSR123", "01", "MFG456", "499.00"),
            sample_line("RSR124", "05", "MFG457", "0")
        );
        let index = FeedIndex::parse(FeedSchema::current(), &text);
        assert_eq!(index.len(), 2);
        let stats = index.stats();
        assert_eq!(stats.parsed, 2);
        assert_eq!(stats.skipped_short, 1);
        assert_eq!(stats.skipped_blank, 1);
        assert!(index.get("RSR999").is_none());
    }

    #[test]
    fn fields_land_on_schema_offsets() {
        let text = sample_line("RSR123", "01", "MFG456", "499.00");
        let index = FeedIndex::parse(FeedSchema::current(), &text);
        let line = index.get("RSR123").expect("line parsed");
        assert_eq!(line.department, "01");
        assert_eq!(line.manufacturer_part_number, "MFG456");
        assert_eq!(line.msrp, Some(599.0));
        assert_eq!(line.wholesale, Some(430.0));
        assert_eq!(line.map_price, Some(499.0));
        assert_eq!(line.quantity, 12);
        assert!(line.in_stock());
    }

    #[test]
    fn zero_map_is_treated_as_absent() {
        let text = sample_line("RSR124", "05", "MFG457", "0");
        let index = FeedIndex::parse(FeedSchema::current(), &text);
        assert_eq!(index.get("RSR124").unwrap().map_price, None);
    }

    #[test]
    fn duplicate_stock_numbers_keep_the_later_line() {
        let text = format!(
            "{}\n{}",
            sample_line("RSR123", "01", "OLD", "0"),
            sample_line("RSR123", "01", "NEW", "0")
        );
        let index = FeedIndex::parse(FeedSchema::current(), &text);
        assert_eq!(index.len(), 1);
        assert_eq!(index.stats().duplicate_stock_numbers, 1);
        assert_eq!(index.get("RSR123").unwrap().manufacturer_part_number, "NEW");
    }

    #[test]
    fn schema_revisions_disagree_only_on_map_offset() {
        let current = FeedSchema::current();
        let old = FeedSchema::revision_1();
        assert_eq!(current.map_price, 70);
        assert_eq!(old.map_price, 62);
        assert_eq!(current.stock_number, old.stock_number);
        assert_eq!(current.min_fields, old.min_fields);
    }

    #[test]
    fn schema_round_trips_through_yaml() {
        let yaml = serde_yaml::to_string(&FeedSchema::current()).expect("serialize");
        let parsed = FeedSchema::from_yaml(&yaml).expect("parse");
        assert_eq!(parsed, FeedSchema::current());
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_snapshots() {
        let dir = tempdir().expect("tempdir");
        let archive = FeedArchive::new(dir.path());
        let delivered_at = DateTime::parse_from_rfc3339("2026-08-01T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_snapshot(delivered_at, b"RSR123;data")
            .await
            .expect("first store");
        let second = archive
            .store_snapshot(delivered_at, b"RSR123;data")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }
}
