//! Core domain model and pure field transforms for CRIS.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cris-core";

/// One product row in the relational catalog store.
///
/// Money columns are carried as two-decimal strings, the same shape the
/// store persists them in; [`pricing::parse_money`] converts them back to
/// numbers when a transform needs arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub department_number: Option<String>,
    pub manufacturer: Option<String>,
    pub rsr_stock_number: Option<String>,
    pub manufacturer_part_number: Option<String>,
    pub price_wholesale: Option<String>,
    pub price_map: Option<String>,
    pub price_msrp: Option<String>,
    pub price_bronze: Option<String>,
    pub price_gold: Option<String>,
    pub price_platinum: Option<String>,
    pub caliber: Option<String>,
    pub capacity: Option<i32>,
    pub barrel_length: Option<String>,
    pub receiver_type: Option<String>,
    pub requires_ffl: bool,
    pub in_stock: bool,
    pub stock_quantity: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CatalogRecord {
    /// Wholesale / MAP / MSRP parsed from their stored string form.
    /// Zero and unparseable values come back as `None`.
    pub fn tier_inputs(&self) -> (Option<f64>, Option<f64>, Option<f64>) {
        (
            self.price_wholesale.as_deref().and_then(pricing::parse_money),
            self.price_map.as_deref().and_then(pricing::parse_money),
            self.price_msrp.as_deref().and_then(pricing::parse_money),
        )
    }
}

/// A single scalar destined for one column (or one index field).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PatchValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

/// Partial field set applied to exactly one record, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordPatch {
    pub fields: BTreeMap<String, PatchValue>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: PatchValue) -> Self {
        self.fields.insert(column.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Per-record result of a maintenance operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecordOutcome {
    Applied,
    Skipped(String),
    Failed(String),
}

/// End-of-run accounting for one maintenance operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub notes: Vec<String>,
}

impl RunSummary {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation: operation.into(),
            started_at: Utc::now(),
            finished_at: None,
            processed: 0,
            applied: 0,
            skipped: 0,
            failed: 0,
            notes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: &RecordOutcome) {
        self.processed += 1;
        match outcome {
            RecordOutcome::Applied => self.applied += 1,
            RecordOutcome::Skipped(_) => self.skipped += 1,
            RecordOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Actual-vs-expected result of one verification check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub check: String,
    pub expected: i64,
    pub actual: i64,
}

impl VerificationReport {
    pub fn new(check: impl Into<String>, expected: i64, actual: i64) -> Self {
        Self {
            check: check.into(),
            expected,
            actual,
        }
    }

    pub fn passed(&self) -> bool {
        self.expected == self.actual
    }
}

/// Uppercase the name and collapse interior whitespace. All keyword and
/// pattern matching runs against this normalized form.
pub fn normalize_name(name: &str) -> String {
    name.to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub mod pricing {
    //! Three-tier customer price derivation from distributor inputs.
    //!
    //! Bronze anchors on MSRP, Gold on MAP, Platinum on dealer cost.
    //! Every output is a two-decimal string; missing or zero inputs
    //! degrade to `"0.00"` rather than erroring.

    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TierPrices {
        pub bronze: String,
        pub gold: String,
        pub platinum: String,
    }

    /// Format a positive amount as a two-decimal string; anything else is `"0.00"`.
    pub fn money(value: f64) -> String {
        if !value.is_finite() || value <= 0.0 {
            return "0.00".to_string();
        }
        format!("{value:.2}")
    }

    /// Parse a stored money string, treating zero/negative/garbage as absent.
    pub fn parse_money(input: &str) -> Option<f64> {
        let value: f64 = input.trim().parse().ok()?;
        (value.is_finite() && value > 0.0).then_some(value)
    }

    /// Derive Bronze/Gold/Platinum from wholesale, MAP, and MSRP.
    ///
    /// Gold falls back from MAP to the MSRP/wholesale midpoint to a 10%
    /// markup over wholesale, in that order.
    pub fn derive_tiers(
        wholesale: Option<f64>,
        map: Option<f64>,
        msrp: Option<f64>,
    ) -> TierPrices {
        let bronze = msrp.map(money).unwrap_or_else(|| "0.00".to_string());
        let gold = if let Some(map) = map {
            money(map)
        } else if let (Some(msrp), Some(wholesale)) = (msrp, wholesale) {
            money((msrp + wholesale) / 2.0)
        } else if let Some(wholesale) = wholesale {
            money(wholesale * 1.10)
        } else {
            "0.00".to_string()
        };
        let platinum = wholesale
            .map(|w| money(w * 1.02))
            .unwrap_or_else(|| "0.00".to_string());
        TierPrices {
            bronze,
            gold,
            platinum,
        }
    }
}

/// Compiled, ordered pattern tables for name-based attribute extraction.
///
/// Pattern order is the tie-break policy: the first matching pattern wins,
/// so reordering a table changes output.
#[derive(Debug)]
pub struct ExtractionRules {
    capacity: Vec<Regex>,
    caliber: Vec<(Regex, &'static str)>,
    barrel_length: Vec<Regex>,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionRules {
    pub fn new() -> Self {
        let capacity = [
            r"\b(\d+)\s*RD\b",
            r"\b(\d+)\s*RDS\b",
            r"\b(\d+)\s*ROUNDS?\b",
            r"\b(\d+)\s*SHOT\b",
            r"\b(\d+)\+\d+\b",
            r"\b(\d+)\s*MAG\b",
            r"\b(\d+)\s*COUNT\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("capacity pattern compiles"))
        .collect();

        let caliber = [
            (r"\b9\s*MM\b|\b9X19\b", "9mm"),
            (r"\b45\s*ACP\b|\b45\s*AUTO\b", "45 ACP"),
            (r"\b40\s*S&W\b|\b40SW\b", "40 S&W"),
            (r"\b380\s*(?:ACP|AUTO)\b", "380 ACP"),
            (r"\b10\s*MM\b", "10mm"),
            (r"\b357\s*MAG(?:NUM)?\b", "357 Magnum"),
            (r"\b38\s*(?:SPL|SPEC(?:IAL)?)\b", "38 Special"),
            (r"\b22\s*LR\b", "22 LR"),
            (r"\b22\s*WMR\b", "22 WMR"),
            (r"\b17\s*HMR\b", "17 HMR"),
            (r"\b5\.56(?:\s*NATO)?\b|\b556(?:\s*NATO)?\b", "5.56 NATO"),
            (r"\b223(?:\s*REM)?\b", "223 Remington"),
            (r"\b300\s*(?:BLK|BLACKOUT|AAC)\b", "300 Blackout"),
            (r"\b308(?:\s*WIN)?\b", "308 Winchester"),
            (r"\b30-06\b|\b3006\b", "30-06 Springfield"),
            (r"\b6\.5\s*CREEDMOOR\b|\b65\s*CREEDMOOR\b", "6.5 Creedmoor"),
            (r"\b7\.62\s*X\s*39\b|\b762X39\b", "7.62x39"),
            (r"\b12\s*GA(?:UGE)?\b", "12 Gauge"),
            (r"\b20\s*GA(?:UGE)?\b", "20 Gauge"),
            (r"\b410\s*(?:GA(?:UGE)?|BORE)?\b", "410 Bore"),
        ]
        .iter()
        .map(|(p, label)| (Regex::new(p).expect("caliber pattern compiles"), *label))
        .collect();

        let barrel_length = [
            r#"\b(\d+(?:\.\d+)?)\s*""#,
            r"\b(\d+(?:\.\d+)?)[-\s]*IN(?:CH)?\b",
            r"\b(\d+(?:\.\d+)?)[-\s]*BBL\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("barrel pattern compiles"))
        .collect();

        Self {
            capacity,
            caliber,
            barrel_length,
        }
    }

    /// Magazine capacity from the product name; only values in [1, 50]
    /// are believable for this catalog.
    pub fn capacity(&self, name: &str) -> Option<u32> {
        let name = normalize_name(name);
        for pattern in &self.capacity {
            if let Some(caps) = pattern.captures(&name) {
                if let Ok(value) = caps[1].parse::<u32>() {
                    if (1..=50).contains(&value) {
                        return Some(value);
                    }
                }
            }
        }
        None
    }

    /// Canonical caliber label, first matching pattern wins.
    pub fn caliber(&self, name: &str) -> Option<&'static str> {
        let name = normalize_name(name);
        self.caliber
            .iter()
            .find(|(pattern, _)| pattern.is_match(&name))
            .map(|(_, label)| *label)
    }

    /// Barrel length in inches, bounded to [1, 60].
    pub fn barrel_length(&self, name: &str) -> Option<f64> {
        let name = normalize_name(name);
        for pattern in &self.barrel_length {
            if let Some(caps) = pattern.captures(&name) {
                if let Ok(value) = caps[1].parse::<f64>() {
                    if (1.0..=60.0).contains(&value) {
                        return Some(value);
                    }
                }
            }
        }
        None
    }
}

pub mod category {
    //! Department-code classification and receiver reassignment rules.

    use super::normalize_name;
    use serde::Serialize;

    pub const UPPERS_LOWERS_CATEGORY: &str = "Uppers/Lowers";
    pub const RECEIVER_DEPARTMENT: &str = "41";

    pub const LOWER_KEYWORDS: [&str; 3] = ["LOWER", "RCVR", "RECEIVER"];
    pub const HANDGUN_HINTS: [&str; 3] = ["PISTOL", "PSTL", "HANDGUN"];

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum ReceiverType {
        Upper,
        HandgunLower,
        RifleLower,
    }

    impl ReceiverType {
        pub fn as_str(&self) -> &'static str {
            match self {
                Self::Upper => "Upper",
                Self::HandgunLower => "Handgun Lower",
                Self::RifleLower => "Rifle Lower",
            }
        }
    }

    /// Business rule awaiting confirmation from the catalog owners: a name
    /// matching both upper and lower keywords is tagged as an upper.
    pub const BOTH_KEYWORDS_RECEIVER: ReceiverType = ReceiverType::Upper;

    fn canonical_department(department: &str) -> &str {
        let trimmed = department.trim().trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    }

    /// Retail category for a distributor department code.
    pub fn category_for_department(department: &str) -> &'static str {
        match canonical_department(department) {
            "1" => "Handguns",
            "2" => "Used Handguns",
            "3" => "Long Guns",
            "4" => "Used Long Guns",
            "5" | "6" => "Ammunition",
            "41" => UPPERS_LOWERS_CATEGORY,
            _ => "Accessories",
        }
    }

    /// Departments 1-4 are firearms and require an FFL transfer.
    pub fn department_requires_ffl(department: &str) -> bool {
        matches!(canonical_department(department), "1" | "2" | "3" | "4")
    }

    /// Classify a product name as a receiver, or `None` when no receiver
    /// keyword is present.
    pub fn classify_receiver(name: &str, department: Option<&str>) -> Option<ReceiverType> {
        let name = normalize_name(name);
        let has_upper = name.contains("UPPER");
        let has_lower = LOWER_KEYWORDS.iter().any(|k| name.contains(k));
        match (has_upper, has_lower) {
            (true, true) => Some(BOTH_KEYWORDS_RECEIVER),
            (true, false) => Some(ReceiverType::Upper),
            (false, true) => {
                let handgun = department
                    .map(|d| canonical_department(d) == "1")
                    .unwrap_or(false)
                    || HANDGUN_HINTS.iter().any(|k| name.contains(k));
                Some(if handgun {
                    ReceiverType::HandgunLower
                } else {
                    ReceiverType::RifleLower
                })
            }
            (false, false) => None,
        }
    }
}

pub mod sku {
    //! Repair of the recurring defect where the distributor's stock number
    //! was persisted as the product SKU.

    use std::collections::HashSet;

    /// Propose the corrected SKU for a record whose SKU equals the
    /// distributor stock number. Returns `None` when the feed carries no
    /// usable manufacturer part number.
    pub fn propose_repair(
        current_sku: &str,
        rsr_stock_number: &str,
        manufacturer_part_number: &str,
    ) -> Option<String> {
        if current_sku != rsr_stock_number {
            return None;
        }
        let part = manufacturer_part_number.trim();
        if part.is_empty() || part == rsr_stock_number {
            return None;
        }
        Some(part.to_string())
    }

    /// Make `candidate` unique against `taken` by appending `-1`, `-2`, ...
    pub fn dedupe(candidate: &str, taken: &HashSet<String>) -> String {
        if !taken.contains(candidate) {
            return candidate.to_string();
        }
        let mut suffix = 1u32;
        loop {
            let attempt = format!("{candidate}-{suffix}");
            if !taken.contains(&attempt) {
                return attempt;
            }
            suffix += 1;
        }
    }
}

/// Convenience alias used by writers that track already-assigned SKUs.
pub type SkuSet = HashSet<String>;
