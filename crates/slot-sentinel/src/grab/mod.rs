//! Grab orchestrator: the mutex-guarded, retry-bounded claim sequence.
//!
//! A claim runs `SELECT_UNIT → SELECT_SUBUNIT → CONFIRM` against a
//! [`PageAdapter`]. Only one claim may be in flight per engine; the
//! [`GrabGate`] enforces that and force-releases a stalled claim after the
//! safety timeout.

pub mod gate;
pub mod scripted;
pub mod sequence;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::signals::{SignalSource, StructuralReport};

pub use gate::{GrabGate, GrabTicket};
pub use scripted::{PageScript, ScriptedPage};
pub use sequence::{GrabReport, GrabSequence, GrabSettings};

/// A selectable element on the page, as identified by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitRef {
    pub id: String,
    /// Visible text, used for time preference matching.
    pub label: String,
}

impl UnitRef {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Result of one attempt to click an available unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSelection {
    Clicked,
    NoCandidates,
    /// Units exist but none fall on a preferred day.
    Filtered,
}

/// Result of one look at the confirm control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmProbe {
    Clicked,
    Disabled,
    /// No confirm control left to press.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrabStep {
    SelectUnit,
    SelectSubunit,
    Confirm,
}

impl std::fmt::Display for GrabStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GrabStep::SelectUnit => "SELECT_UNIT",
            GrabStep::SelectSubunit => "SELECT_SUBUNIT",
            GrabStep::Confirm => "CONFIRM",
        };
        f.write_str(name)
    }
}

/// Why a claim starts, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrabTrigger {
    pub source: SignalSource,
    /// Sub-units are already rendered, so SELECT_UNIT is skipped.
    pub skip_select_unit: bool,
}

/// How a claim ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GrabOutcome {
    /// The page navigated after confirming.
    Succeeded { url: String },
    /// Sub-units were selected and confirmation chaining is off.
    SubunitsSelected,
    /// Confirm controls ran out without a navigation.
    ConfirmChainEnded,
    /// Units on the page do not match the preferred days.
    Filtered,
    Exhausted { step: GrabStep },
    Cancelled,
    SafetyTimeout,
}

impl GrabOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GrabOutcome::Succeeded { .. })
    }

    /// Terminal failures that fall back to a full reload.
    pub fn needs_reload(&self) -> bool {
        matches!(
            self,
            GrabOutcome::Exhausted { .. } | GrabOutcome::SafetyTimeout
        )
    }
}

impl std::fmt::Display for GrabOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrabOutcome::Succeeded { url } => write!(f, "succeeded ({url})"),
            GrabOutcome::SubunitsSelected => write!(f, "sub-units selected"),
            GrabOutcome::ConfirmChainEnded => write!(f, "confirm chain ended"),
            GrabOutcome::Filtered => write!(f, "filtered by preferred days"),
            GrabOutcome::Exhausted { step } => write!(f, "retries exhausted in {step}"),
            GrabOutcome::Cancelled => write!(f, "cancelled"),
            GrabOutcome::SafetyTimeout => write!(f, "safety timeout"),
        }
    }
}

/// The page-side capabilities a claim needs.
///
/// Implementations own the heuristics for what counts as a unit, a
/// sub-unit, or a confirm control. Every method must be safe to call
/// repeatedly.
#[async_trait]
pub trait PageAdapter: Send + Sync {
    /// Click the first available unit on one of `preferred_days` (any day when empty).
    async fn select_unit(&self, preferred_days: &[u8]) -> UnitSelection;

    /// Currently selectable sub-units, best ranked first.
    async fn select_sub_units(&self) -> Vec<UnitRef>;

    async fn activate_sub_unit(&self, unit: &UnitRef);

    /// Press the confirm control; `force` presses it even while disabled.
    async fn try_confirm(&self, force: bool) -> ConfirmProbe;

    /// Make the page re-request and re-render its unit data without a full reload.
    async fn force_refresh_context(&self) -> bool;

    async fn inspect(&self) -> StructuralReport;

    /// Visible page text, scanned for block-page wording. Adapters that
    /// cannot read text report nothing.
    async fn page_text(&self) -> String {
        String::new()
    }

    async fn current_url(&self) -> String;

    async fn reload(&self);
}
