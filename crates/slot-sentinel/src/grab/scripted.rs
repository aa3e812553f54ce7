//! A programmable [`PageAdapter`] for dry runs and tests.
//!
//! The script says what each call returns; the page records what the claim
//! sequence did to it.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{ConfirmProbe, PageAdapter, UnitRef, UnitSelection};
use crate::signals::StructuralReport;

fn default_start_url() -> String {
    "https://scheduler.example/schedule".to_string()
}

fn default_true() -> bool {
    true
}

fn default_unit_selection() -> UnitSelection {
    UnitSelection::NoCandidates
}

fn default_confirm() -> ConfirmProbe {
    ConfirmProbe::Done
}

/// Declarative page behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageScript {
    #[serde(default = "default_start_url")]
    pub start_url: String,
    #[serde(default)]
    pub sold_out: bool,
    #[serde(default)]
    pub has_sub_units: bool,
    #[serde(default = "default_true")]
    pub context_selected: bool,
    /// Results for successive `select_unit` calls.
    #[serde(default)]
    pub unit_selections: Vec<UnitSelection>,
    /// Result once `unit_selections` is used up.
    #[serde(default = "default_unit_selection")]
    pub unit_default: UnitSelection,
    /// Labels of the sub-units the page offers, best ranked first.
    #[serde(default)]
    pub sub_units: Vec<String>,
    /// Calls to `select_sub_units` that return nothing before they appear.
    #[serde(default)]
    pub sub_units_after: u32,
    #[serde(default)]
    pub confirm_probes: Vec<ConfirmProbe>,
    #[serde(default = "default_confirm")]
    pub confirm_default: ConfirmProbe,
    /// Where the page navigates after an enabled confirm click.
    #[serde(default)]
    pub navigate_on_confirm: Option<String>,
    #[serde(default = "default_true")]
    pub refresh_succeeds: bool,
    /// `select_unit` never returns, simulating a hung page.
    #[serde(default)]
    pub stall_on_select_unit: bool,
    /// `inspect` never returns.
    #[serde(default)]
    pub stall_on_inspect: bool,
    /// Text the page shows, e.g. a captcha notice.
    #[serde(default)]
    pub page_text: String,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            start_url: default_start_url(),
            sold_out: false,
            has_sub_units: false,
            context_selected: true,
            unit_selections: Vec::new(),
            unit_default: default_unit_selection(),
            sub_units: Vec::new(),
            sub_units_after: 0,
            confirm_probes: Vec::new(),
            confirm_default: default_confirm(),
            navigate_on_confirm: None,
            refresh_succeeds: true,
            stall_on_select_unit: false,
            stall_on_inspect: false,
            page_text: String::new(),
        }
    }
}

#[derive(Debug, Default)]
struct PageState {
    report: StructuralReport,
    text: String,
    url: String,
    inspections: u32,
    units: VecDeque<UnitSelection>,
    confirms: VecDeque<ConfirmProbe>,
    unit_calls: u32,
    sub_unit_calls: u32,
    activated: Vec<UnitRef>,
    forced_confirms: u32,
    refreshes: u32,
    reloads: u32,
}

/// In-memory page driven by a [`PageScript`].
#[derive(Debug)]
pub struct ScriptedPage {
    script: PageScript,
    state: Mutex<PageState>,
}

impl ScriptedPage {
    pub fn new(script: PageScript) -> Self {
        let state = PageState {
            report: StructuralReport {
                sold_out: script.sold_out,
                has_sub_units: script.has_sub_units,
                context_selected: script.context_selected,
            },
            text: script.page_text.clone(),
            url: script.start_url.clone(),
            units: script.unit_selections.iter().copied().collect(),
            confirms: script.confirm_probes.iter().copied().collect(),
            ..Default::default()
        };
        Self {
            script,
            state: Mutex::new(state),
        }
    }

    /// Change what the next `inspect` reports.
    pub async fn set_report(&self, report: StructuralReport) {
        self.state.lock().await.report = report;
    }

    /// Change the text the page shows.
    pub async fn set_page_text(&self, text: impl Into<String>) {
        self.state.lock().await.text = text.into();
    }

    pub async fn inspections(&self) -> u32 {
        self.state.lock().await.inspections
    }

    pub async fn activated(&self) -> Vec<UnitRef> {
        self.state.lock().await.activated.clone()
    }

    pub async fn unit_calls(&self) -> u32 {
        self.state.lock().await.unit_calls
    }

    pub async fn sub_unit_calls(&self) -> u32 {
        self.state.lock().await.sub_unit_calls
    }

    pub async fn forced_confirms(&self) -> u32 {
        self.state.lock().await.forced_confirms
    }

    pub async fn refreshes(&self) -> u32 {
        self.state.lock().await.refreshes
    }

    pub async fn reloads(&self) -> u32 {
        self.state.lock().await.reloads
    }
}

#[async_trait]
impl PageAdapter for ScriptedPage {
    async fn select_unit(&self, _preferred_days: &[u8]) -> UnitSelection {
        if self.script.stall_on_select_unit {
            self.state.lock().await.unit_calls += 1;
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().await;
        state.unit_calls += 1;
        state.units.pop_front().unwrap_or(self.script.unit_default)
    }

    async fn select_sub_units(&self) -> Vec<UnitRef> {
        let mut state = self.state.lock().await;
        state.sub_unit_calls += 1;
        if state.sub_unit_calls <= self.script.sub_units_after {
            return Vec::new();
        }
        self.script
            .sub_units
            .iter()
            .enumerate()
            .map(|(i, label)| UnitRef::new(format!("sub-{i}"), label.clone()))
            .collect()
    }

    async fn activate_sub_unit(&self, unit: &UnitRef) {
        self.state.lock().await.activated.push(unit.clone());
    }

    async fn try_confirm(&self, force: bool) -> ConfirmProbe {
        let mut state = self.state.lock().await;
        if force {
            state.forced_confirms += 1;
            return ConfirmProbe::Clicked;
        }
        let probe = state.confirms.pop_front().unwrap_or(self.script.confirm_default);
        if probe == ConfirmProbe::Clicked {
            if let Some(next) = &self.script.navigate_on_confirm {
                state.url = next.clone();
            }
        }
        probe
    }

    async fn force_refresh_context(&self) -> bool {
        self.state.lock().await.refreshes += 1;
        self.script.refresh_succeeds
    }

    async fn inspect(&self) -> StructuralReport {
        let report = {
            let mut state = self.state.lock().await;
            state.inspections += 1;
            state.report
        };
        if self.script.stall_on_inspect {
            std::future::pending::<()>().await;
        }
        report
    }

    async fn page_text(&self) -> String {
        self.state.lock().await.text.clone()
    }

    async fn current_url(&self) -> String {
        self.state.lock().await.url.clone()
    }

    async fn reload(&self) {
        let mut state = self.state.lock().await;
        state.reloads += 1;
        state.url = self.script.start_url.clone();
    }
}
