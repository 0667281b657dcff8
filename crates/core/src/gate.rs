//! Scan Gate: admission of raw codes into count events.
//!
//! Camera scans and manual entry go through the same [`ScanGate::admit`]
//! function. Checks run in a fixed order and short-circuit:
//!
//! 1. cooldown (camera only): the same raw code seen again within the
//!    cooldown window is ignored without feedback
//! 2. format whitelist (camera only; manual entry has no format tag)
//! 3. stock membership
//! 4. already counted (confirmed or pending)

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::Serial;
use crate::stock::StockIndex;

/// Barcode symbologies the decoder can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarcodeFormat {
    Code128,
    Code39,
    Ean13,
    Ean8,
    UpcA,
    UpcE,
    Itf,
    Codabar,
    QrCode,
    DataMatrix,
    Pdf417,
    Aztec,
}

impl BarcodeFormat {
    pub const ALL: [BarcodeFormat; 12] = [
        BarcodeFormat::Code128,
        BarcodeFormat::Code39,
        BarcodeFormat::Ean13,
        BarcodeFormat::Ean8,
        BarcodeFormat::UpcA,
        BarcodeFormat::UpcE,
        BarcodeFormat::Itf,
        BarcodeFormat::Codabar,
        BarcodeFormat::QrCode,
        BarcodeFormat::DataMatrix,
        BarcodeFormat::Pdf417,
        BarcodeFormat::Aztec,
    ];

    /// Tag as reported by the decoder.
    pub fn tag(&self) -> &'static str {
        match self {
            BarcodeFormat::Code128 => "CODE_128",
            BarcodeFormat::Code39 => "CODE_39",
            BarcodeFormat::Ean13 => "EAN_13",
            BarcodeFormat::Ean8 => "EAN_8",
            BarcodeFormat::UpcA => "UPC_A",
            BarcodeFormat::UpcE => "UPC_E",
            BarcodeFormat::Itf => "ITF",
            BarcodeFormat::Codabar => "CODABAR",
            BarcodeFormat::QrCode => "QR_CODE",
            BarcodeFormat::DataMatrix => "DATA_MATRIX",
            BarcodeFormat::Pdf417 => "PDF_417",
            BarcodeFormat::Aztec => "AZTEC",
        }
    }
}

impl FromStr for BarcodeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        BarcodeFormat::ALL
            .into_iter()
            .find(|f| f.tag() == tag)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for BarcodeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Set of formats a deployment accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatWhitelist(BTreeSet<BarcodeFormat>);

impl FormatWhitelist {
    /// Linear serial-number symbologies only.
    pub fn strict() -> Self {
        Self([BarcodeFormat::Code128, BarcodeFormat::Code39].into_iter().collect())
    }

    /// Every 1D and 2D format the decoder reports.
    pub fn wide() -> Self {
        Self(BarcodeFormat::ALL.into_iter().collect())
    }

    /// Unknown tags are never allowed.
    pub fn allows(&self, tag: &str) -> bool {
        tag.parse::<BarcodeFormat>()
            .map(|f| self.0.contains(&f))
            .unwrap_or(false)
    }

    pub fn formats(&self) -> impl Iterator<Item = BarcodeFormat> + '_ {
        self.0.iter().copied()
    }
}

impl Default for FormatWhitelist {
    fn default() -> Self {
        Self::strict()
    }
}

/// Where a code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource<'a> {
    /// Decoded by the camera, with the decoder's format tag.
    Camera { format: &'a str },
    /// Typed by the operator.
    Manual,
}

/// Why a code was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum RejectReason {
    UnsupportedFormat { format: String },
    UnknownIdentifier,
    AlreadyCounted,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::UnsupportedFormat { .. } => "unsupported-format",
            RejectReason::UnknownIdentifier => "unknown-identifier",
            RejectReason::AlreadyCounted => "already-counted",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnsupportedFormat { format } => {
                write!(f, "unsupported-format ({format})")
            }
            other => f.write_str(other.code()),
        }
    }
}

/// Outcome of a gate decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted { serial: Serial, name: String },
    Rejected { code: String, reason: RejectReason },
    /// Repeat read within the cooldown window; no feedback.
    Ignored,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }
}

/// Answers "is this identifier already counted?" for the gate.
///
/// Implementations must include pending (unconfirmed) events so an item
/// cannot be resubmitted before its first count is acknowledged.
pub trait CountedLookup {
    fn is_counted(&self, serial: &Serial) -> bool;
}

impl<F> CountedLookup for F
where
    F: Fn(&Serial) -> bool,
{
    fn is_counted(&self, serial: &Serial) -> bool {
        self(serial)
    }
}

impl CountedLookup for crate::count::ConfirmedCounts {
    fn is_counted(&self, serial: &Serial) -> bool {
        self.contains(serial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LastScan {
    code: String,
    at: DateTime<Utc>,
}

/// Stateful admission gate (holds only the cooldown reference).
#[derive(Debug, Clone)]
pub struct ScanGate {
    cooldown: Duration,
    formats: FormatWhitelist,
    last: Option<LastScan>,
}

impl ScanGate {
    pub fn new(cooldown: Duration, formats: FormatWhitelist) -> Self {
        Self {
            cooldown,
            formats,
            last: None,
        }
    }

    pub fn formats(&self) -> &FormatWhitelist {
        &self.formats
    }

    /// Decide whether `raw` may become a count event.
    pub fn admit(
        &mut self,
        raw: &str,
        source: ScanSource<'_>,
        now: DateTime<Utc>,
        stock: &StockIndex,
        counted: &impl CountedLookup,
    ) -> Admission {
        if let ScanSource::Camera { format } = source {
            if self.in_cooldown(raw, now) {
                return Admission::Ignored;
            }
            self.last = Some(LastScan {
                code: raw.to_string(),
                at: now,
            });

            if !self.formats.allows(format) {
                return reject(raw, RejectReason::UnsupportedFormat {
                    format: format.to_string(),
                });
            }
        }

        let Some(item) = stock.lookup(raw) else {
            return reject(raw, RejectReason::UnknownIdentifier);
        };

        if counted.is_counted(&item.serial) {
            return reject(raw, RejectReason::AlreadyCounted);
        }

        Admission::Accepted {
            serial: item.serial.clone(),
            name: item.name.clone(),
        }
    }

    fn in_cooldown(&self, raw: &str, now: DateTime<Utc>) -> bool {
        match &self.last {
            Some(last) => last.code == raw && now - last.at < self.cooldown,
            None => false,
        }
    }
}

fn reject(raw: &str, reason: RejectReason) -> Admission {
    Admission::Rejected {
        code: raw.trim().to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stock::StockItem;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn stock() -> StockIndex {
        StockIndex::from_items(["SN001", "SN002", "SN003"].map(|s| {
            StockItem::new(Serial::parse(s).unwrap(), format!("Product {s}"))
        }))
    }

    fn gate() -> ScanGate {
        ScanGate::new(Duration::milliseconds(3000), FormatWhitelist::strict())
    }

    const CAM: ScanSource<'static> = ScanSource::Camera { format: "CODE_128" };

    fn nothing_counted() -> impl Fn(&Serial) -> bool {
        |_: &Serial| false
    }

    #[test]
    fn accepts_known_uncounted_code() {
        let mut gate = gate();
        let admission = gate.admit("SN001", CAM, t(0), &stock(), &nothing_counted());
        assert_eq!(
            admission,
            Admission::Accepted {
                serial: Serial::parse("sn001").unwrap(),
                name: "Product SN001".to_string(),
            }
        );
    }

    #[test]
    fn repeat_within_cooldown_is_ignored_then_rechecked() {
        let mut gate = gate();
        let mut counted: HashSet<Serial> = HashSet::new();
        let stock = stock();

        let first = gate.admit("SN002", CAM, t(0), &stock, &|s: &Serial| counted.contains(s));
        assert!(first.is_accepted());
        counted.insert(Serial::parse("SN002").unwrap());

        let second = gate.admit("SN002", CAM, t(1500), &stock, &|s: &Serial| counted.contains(s));
        assert_eq!(second, Admission::Ignored);

        let third = gate.admit("SN002", CAM, t(3000), &stock, &|s: &Serial| counted.contains(s));
        assert!(matches!(
            third,
            Admission::Rejected { reason: RejectReason::AlreadyCounted, .. }
        ));
    }

    #[test]
    fn cooldown_only_applies_to_identical_previous_code() {
        let mut gate = gate();
        let stock = stock();
        gate.admit("SN001", CAM, t(0), &stock, &nothing_counted());
        gate.admit("SN002", CAM, t(100), &stock, &nothing_counted());
        let again = gate.admit("SN001", CAM, t(200), &stock, &nothing_counted());
        assert!(again.is_accepted());
    }

    #[test]
    fn rejected_scans_also_arm_the_cooldown() {
        let mut gate = gate();
        let stock = stock();
        let first = gate.admit("NOPE", CAM, t(0), &stock, &nothing_counted());
        assert!(matches!(first, Admission::Rejected { reason: RejectReason::UnknownIdentifier, .. }));
        assert_eq!(gate.admit("NOPE", CAM, t(10), &stock, &nothing_counted()), Admission::Ignored);
    }

    #[test]
    fn format_outside_whitelist_is_rejected() {
        let mut gate = gate();
        let admission = gate.admit(
            "SN001",
            ScanSource::Camera { format: "QR_CODE" },
            t(0),
            &stock(),
            &nothing_counted(),
        );
        assert_eq!(
            admission,
            Admission::Rejected {
                code: "SN001".to_string(),
                reason: RejectReason::UnsupportedFormat { format: "QR_CODE".to_string() },
            }
        );
    }

    #[test]
    fn wide_profile_accepts_2d_formats_but_not_unknown_tags() {
        let wide = FormatWhitelist::wide();
        assert!(wide.allows("QR_CODE"));
        assert!(wide.allows("data_matrix"));
        assert!(!wide.allows("MAXICODE"));
    }

    #[test]
    fn manual_entry_skips_cooldown_and_format_but_not_membership() {
        let mut gate = gate();
        let stock = stock();
        assert!(gate.admit("SN003", ScanSource::Manual, t(0), &stock, &nothing_counted()).is_accepted());
        assert!(gate.admit("SN003", ScanSource::Manual, t(1), &stock, &nothing_counted()).is_accepted());
        assert!(matches!(
            gate.admit("  ", ScanSource::Manual, t(2), &stock, &nothing_counted()),
            Admission::Rejected { reason: RejectReason::UnknownIdentifier, .. }
        ));
    }

    #[test]
    fn reject_reason_codes_are_stable() {
        assert_eq!(RejectReason::AlreadyCounted.code(), "already-counted");
        assert_eq!(RejectReason::UnknownIdentifier.to_string(), "unknown-identifier");
        let json = serde_json::to_value(RejectReason::UnsupportedFormat { format: "X".into() }).unwrap();
        assert_eq!(json["reason"], "unsupported-format");
    }
}
