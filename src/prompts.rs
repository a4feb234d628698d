//! Prompts for tile analysis, cross-section synthesis and structured analysis.
//!
//! Every prompt lives here so tests can inspect them without a live model,
//! and so wording changes never touch orchestration code.
//!
//! Callers can override the structured-analysis directive via
//! [`crate::config::AnalysisConfig::system_prompt`]; the tile and summary
//! prompts are fixed because their position labels must stay in sync with the
//! row-major tile order.

use crate::output::SectionAnalysisResult;

/// Prompt for one tile of a construction drawing.
///
/// `index` is the 0-based submission position; rows and columns are shown
/// 1-based, matching the labels used in [`section_digest`].
pub fn section_prompt(index: usize, total: usize, x: u32, y: u32) -> String {
    format!(
        "This is an image from a construction drawing, grid section {} of {} (row {}, column {}). \
Please analyze this section and provide detailed observations about any construction elements, \
measurements, annotations, or technical details visible in this section only.",
        index + 1,
        total,
        y + 1,
        x + 1
    )
}

/// Label every section result in submission order.
///
/// Produces `"Section N (Row R, Column C): <text>"` blocks separated by a
/// blank line.
pub fn section_digest(sections: &[SectionAnalysisResult]) -> String {
    sections
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "Section {} (Row {}, Column {}): {}",
                i + 1,
                s.grid_position.y + 1,
                s.grid_position.x + 1,
                s.analysis
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Prompt asking for a cross-section synthesis of all tile analyses.
pub fn summary_prompt(sections: &[SectionAnalysisResult]) -> String {
    format!(
        "I have analyzed a construction drawing by dividing it into sections. Based on the following \
section analyses, please provide a comprehensive summary of the entire drawing, identifying key \
elements, measurements, and how different sections relate to each other:\n\n{}",
        section_digest(sections)
    )
}

/// Default directive for the streamed structured analysis of a converted document.
///
/// Names the five analysis dimensions and pins the JSON shape the incremental
/// extractor expects.
pub const DEFAULT_ANALYSIS_DIRECTIVE: &str = r#"You are an AI assistant specializing in construction management. Please analyze the attached document according to the following areas and return your output in **valid JSON** with the specified structure:

1. **comprehensive_summary**
   - Provide a thorough summary of the document's main points, ensuring no critical information is missed.

2. **risk_and_compliance_analysis**
   - Identify any potential risks, safety considerations, regulatory obligations, or legal concerns mentioned or implied.

3. **impact_on_scheduling_and_programming**
   - Discuss how the document's content might affect project timelines, resources, and milestones.

4. **forecasting_and_recommendations**
   - Suggest proactive measures to address or mitigate any identified risks and leverage potential opportunities.

5. **contextual_understanding**
   - Relate the document's information to the broader project context, ensuring the analysis remains relevant and actionable.

**Your final response must be in the following JSON format**:

```json
{
  "analysis": {
    "comprehensive_summary": "",
    "risk_and_compliance_analysis": "",
    "impact_on_scheduling_and_programming": "",
    "forecasting_and_recommendations": "",
    "contextual_understanding": ""
  }
}
```"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{AnalysisSection, GridPosition};

    fn result(x: u32, y: u32, text: &str) -> SectionAnalysisResult {
        SectionAnalysisResult {
            grid_position: GridPosition { x, y },
            analysis: text.to_string(),
        }
    }

    #[test]
    fn section_prompt_labels_are_one_based() {
        let p = section_prompt(2, 4, 0, 1);
        assert!(p.contains("grid section 3 of 4"));
        assert!(p.contains("(row 2, column 1)"));
        assert!(p.contains("this section only"));
    }

    #[test]
    fn digest_follows_submission_order() {
        let sections = vec![
            result(0, 0, "north wall"),
            result(1, 0, "stair core"),
            result(0, 1, "footing"),
        ];
        let digest = section_digest(&sections);
        assert_eq!(
            digest,
            "Section 1 (Row 1, Column 1): north wall\n\n\
Section 2 (Row 1, Column 2): stair core\n\n\
Section 3 (Row 2, Column 1): footing"
        );
    }

    #[test]
    fn summary_prompt_embeds_digest() {
        let p = summary_prompt(&[result(0, 0, "beam schedule")]);
        assert!(p.ends_with("Section 1 (Row 1, Column 1): beam schedule"));
    }

    #[test]
    fn directive_names_every_dimension() {
        for section in AnalysisSection::ALL {
            assert!(
                DEFAULT_ANALYSIS_DIRECTIVE.contains(section.key()),
                "missing {}",
                section.key()
            );
        }
    }
}
