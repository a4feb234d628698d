//! Result types produced by grid analysis and the document pipeline.
//!
//! Field names on the wire follow the dashboard's JSON contract
//! (`gridPosition`, `gridSize`, `analysis`), hence the serde renames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 0-indexed grid coordinate of a tile: `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPosition {
    pub x: u32,
    pub y: u32,
}

/// Free-text analysis of one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionAnalysisResult {
    #[serde(rename = "gridPosition")]
    pub grid_position: GridPosition,
    pub analysis: String,
}

/// Terminal output of one grid analysis request.
///
/// `sections` is in row-major submission order: `(0,0), (1,0), …, (g-1,g-1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedGridResult {
    pub grid_size: u32,
    pub sections: Vec<SectionAnalysisResult>,
    pub summary: String,
}

/// The five named dimensions of a structured construction analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSection {
    ComprehensiveSummary,
    RiskAndComplianceAnalysis,
    ImpactOnSchedulingAndProgramming,
    ForecastingAndRecommendations,
    ContextualUnderstanding,
}

impl AnalysisSection {
    /// Canonical presentation order.
    pub const ALL: [AnalysisSection; 5] = [
        AnalysisSection::ComprehensiveSummary,
        AnalysisSection::RiskAndComplianceAnalysis,
        AnalysisSection::ImpactOnSchedulingAndProgramming,
        AnalysisSection::ForecastingAndRecommendations,
        AnalysisSection::ContextualUnderstanding,
    ];

    /// JSON key of this dimension.
    pub fn key(self) -> &'static str {
        match self {
            AnalysisSection::ComprehensiveSummary => "comprehensive_summary",
            AnalysisSection::RiskAndComplianceAnalysis => "risk_and_compliance_analysis",
            AnalysisSection::ImpactOnSchedulingAndProgramming => {
                "impact_on_scheduling_and_programming"
            }
            AnalysisSection::ForecastingAndRecommendations => "forecasting_and_recommendations",
            AnalysisSection::ContextualUnderstanding => "contextual_understanding",
        }
    }

    /// Human-readable heading.
    pub fn title(self) -> &'static str {
        match self {
            AnalysisSection::ComprehensiveSummary => "Summary",
            AnalysisSection::RiskAndComplianceAnalysis => "Risks & Compliance",
            AnalysisSection::ImpactOnSchedulingAndProgramming => "Scheduling Impact",
            AnalysisSection::ForecastingAndRecommendations => "Recommendations",
            AnalysisSection::ContextualUnderstanding => "Context",
        }
    }
}

/// Typed view of a structured-analysis snapshot.
///
/// Missing or non-string dimensions are `None`; a snapshot is only ever
/// replaced wholesale, so there is no field-by-field merge here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstructionAnalysis {
    pub comprehensive_summary: Option<String>,
    pub risk_and_compliance_analysis: Option<String>,
    pub impact_on_scheduling_and_programming: Option<String>,
    pub forecasting_and_recommendations: Option<String>,
    pub contextual_understanding: Option<String>,
}

impl ConstructionAnalysis {
    /// Read the five dimensions from a parsed fragment.
    ///
    /// Accepts both `{"analysis": {…}}` and a bare `{…}` object. Returns
    /// `None` when the fragment carries none of the five keys.
    pub fn from_fragment(fragment: &Value) -> Option<Self> {
        let body = fragment
            .get("analysis")
            .filter(|v| v.is_object())
            .unwrap_or(fragment);
        let text = |section: AnalysisSection| {
            body.get(section.key())
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let analysis = Self {
            comprehensive_summary: text(AnalysisSection::ComprehensiveSummary),
            risk_and_compliance_analysis: text(AnalysisSection::RiskAndComplianceAnalysis),
            impact_on_scheduling_and_programming: text(
                AnalysisSection::ImpactOnSchedulingAndProgramming,
            ),
            forecasting_and_recommendations: text(AnalysisSection::ForecastingAndRecommendations),
            contextual_understanding: text(AnalysisSection::ContextualUnderstanding),
        };
        if AnalysisSection::ALL.iter().all(|s| analysis.get(*s).is_none()) {
            None
        } else {
            Some(analysis)
        }
    }

    pub fn get(&self, section: AnalysisSection) -> Option<&str> {
        let field = match section {
            AnalysisSection::ComprehensiveSummary => &self.comprehensive_summary,
            AnalysisSection::RiskAndComplianceAnalysis => &self.risk_and_compliance_analysis,
            AnalysisSection::ImpactOnSchedulingAndProgramming => {
                &self.impact_on_scheduling_and_programming
            }
            AnalysisSection::ForecastingAndRecommendations => &self.forecasting_and_recommendations,
            AnalysisSection::ContextualUnderstanding => &self.contextual_understanding,
        };
        field.as_deref()
    }

    /// Dimensions with non-empty text that differs from `previous`, in canonical order.
    pub fn changed_since(&self, previous: Option<&ConstructionAnalysis>) -> Vec<AnalysisSection> {
        AnalysisSection::ALL
            .into_iter()
            .filter(|s| {
                let now = self.get(*s).filter(|t| !t.trim().is_empty());
                now.is_some() && now != previous.and_then(|p| p.get(*s))
            })
            .collect()
    }
}

/// Output of an eager document analysis run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentAnalysisOutput {
    /// Full markdown produced by the converter (phase 1).
    pub markdown: String,
    /// Latest successfully parsed fragment of phase 2, if any.
    ///
    /// `None` means the stream ended without a single parseable object and
    /// must be treated as a failed or partial analysis.
    pub analysis: Option<Value>,
    /// Number of fragments parsed during phase 2.
    pub fragments: usize,
}

impl DocumentAnalysisOutput {
    /// Typed view of the final snapshot.
    pub fn structured(&self) -> Option<ConstructionAnalysis> {
        self.analysis.as_ref().and_then(ConstructionAnalysis::from_fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn combined_result_uses_dashboard_field_names() {
        let r = CombinedGridResult {
            grid_size: 2,
            sections: vec![SectionAnalysisResult {
                grid_position: GridPosition { x: 1, y: 0 },
                analysis: "door schedule".into(),
            }],
            summary: "overall".into(),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["gridSize"], 2);
        assert_eq!(v["sections"][0]["gridPosition"]["x"], 1);
        assert_eq!(v["sections"][0]["analysis"], "door schedule");
        assert_eq!(v["summary"], "overall");
    }

    #[test]
    fn fragment_with_analysis_wrapper() {
        let v = json!({"analysis": {"comprehensive_summary": "S", "contextual_understanding": "C"}});
        let a = ConstructionAnalysis::from_fragment(&v).unwrap();
        assert_eq!(a.get(AnalysisSection::ComprehensiveSummary), Some("S"));
        assert_eq!(a.get(AnalysisSection::ContextualUnderstanding), Some("C"));
        assert_eq!(a.get(AnalysisSection::RiskAndComplianceAnalysis), None);
    }

    #[test]
    fn bare_fragment_accepted() {
        let v = json!({"risk_and_compliance_analysis": "fall hazards"});
        let a = ConstructionAnalysis::from_fragment(&v).unwrap();
        assert_eq!(
            a.get(AnalysisSection::RiskAndComplianceAnalysis),
            Some("fall hazards")
        );
    }

    #[test]
    fn unrelated_fragment_is_none() {
        assert!(ConstructionAnalysis::from_fragment(&json!({"a": 1})).is_none());
    }

    #[test]
    fn changed_since_reports_new_and_edited_sections_in_order() {
        let first = ConstructionAnalysis::from_fragment(&json!({
            "contextual_understanding": "ctx",
            "comprehensive_summary": "sum"
        }))
        .unwrap();
        assert_eq!(
            first.changed_since(None),
            vec![
                AnalysisSection::ComprehensiveSummary,
                AnalysisSection::ContextualUnderstanding
            ]
        );

        let second = ConstructionAnalysis::from_fragment(&json!({
            "comprehensive_summary": "sum",
            "contextual_understanding": "ctx v2",
            "risk_and_compliance_analysis": ""
        }))
        .unwrap();
        assert_eq!(
            second.changed_since(Some(&first)),
            vec![AnalysisSection::ContextualUnderstanding]
        );
    }
}
