//! Plain-text rendering of an [`AnalysisResult`] for the terminal.

use crate::analysis_types::AnalysisResult;
use std::fmt::Write;

const CORRECT_MARK: &str = "\u{2713}";
const INCORRECT_MARK: &str = "\u{2717}";

pub fn render(result: &AnalysisResult) -> String {
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "Math Problem Analysis");
    let _ = writeln!(out, "=====================");
    let _ = writeln!(out, "Grade: {}  ({}%)", result.grade, result.percentage);
    let _ = writeln!(
        out,
        "Questions: {}   Correct: {}   Incorrect: {}",
        result.total_questions, result.correct_answers, result.incorrect_answers
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "Overall feedback");
    let _ = writeln!(out, "  {}", result.feedback);

    if !result.question_analysis.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Question analysis");
        for question in &result.question_analysis {
            let (mark, label) = if question.is_correct {
                (CORRECT_MARK, "Correct")
            } else {
                (INCORRECT_MARK, "Incorrect")
            };
            let _ = writeln!(
                out,
                "  {} Question {} [{}]: {}",
                mark, question.question_number, label, question.feedback
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::scenarios;
    use crate::normalizer::fallback;

    #[test]
    fn renders_summary_and_marks() {
        let text = render(&scenarios()[0]);
        assert!(text.contains("Grade: B+  (80%)"));
        assert!(text.contains("Questions: 5   Correct: 4   Incorrect: 1"));
        assert_eq!(text.matches(CORRECT_MARK).count(), 4);
        assert_eq!(text.matches(INCORRECT_MARK).count(), 1);
        assert!(text.contains("Question 3 [Incorrect]"));
    }

    #[test]
    fn renders_degraded_result() {
        let text = render(&fallback("I could not identify any problems."));
        assert!(text.contains("Grade: N/A  (0%)"));
        assert!(text.contains("I could not identify any problems."));
    }
}
