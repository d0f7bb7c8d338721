//! Turns whatever a backend said into a well-formed [`AnalysisResult`].
//!
//! [`normalize`] is total. A response that embeds a schema-shaped JSON object is
//! parsed and repaired; anything else becomes a degraded single-question result
//! that carries the raw text as feedback. Callers never see a parse error.

use crate::analysis_types::{AnalysisResult, Grade, QuestionAnalysis};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

pub const UNABLE_TO_ANALYZE_MESSAGE: &str =
    "Unable to analyze the image. Please make sure the math problems are clearly visible and try again.";
pub const NOT_ANALYZED_FEEDBACK: &str = "not analyzed";
const MISSING_FEEDBACK_MESSAGE: &str = "No feedback provided.";

/// Upper bound on questions in one result. Larger counts are treated as garbage.
pub const MAX_QUESTIONS: u32 = 500;

static FENCED_JSON: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").ok());

pub fn normalize(raw: &str) -> AnalysisResult {
    for candidate in candidate_objects(raw) {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let Some(parsed) = parse_schema(&value) else {
            debug!("Skipping JSON object that does not match the result schema");
            continue;
        };
        match repair(parsed) {
            Some(result) => return result,
            None => warn!("Skipping result object with implausible question counts"),
        }
    }

    debug!("No result object found in {} chars of backend output", raw.len());
    fallback(raw)
}

/// The degraded result used when no schema object can be recovered.
pub fn fallback(raw: &str) -> AnalysisResult {
    let text = if raw.trim().is_empty() {
        UNABLE_TO_ANALYZE_MESSAGE.to_string()
    } else {
        raw.to_string()
    };

    AnalysisResult {
        total_questions: 1,
        correct_answers: 0,
        incorrect_answers: 1,
        grade: Grade::NotAvailable,
        percentage: 0,
        feedback: text.clone(),
        question_analysis: vec![QuestionAnalysis {
            question_number: 1,
            is_correct: false,
            feedback: text,
        }],
    }
}

/* ──────────────────────────────────────────────────────────────── */

/// Fenced ```json blocks first, then every balanced `{...}` in order of its
/// opening brace.
fn candidate_objects(raw: &str) -> Vec<&str> {
    let mut candidates: Vec<&str> = FENCED_JSON
        .iter()
        .flat_map(|re| re.captures_iter(raw))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    for (start, ch) in raw.char_indices() {
        if ch == '{' {
            if let Some(end) = matching_brace(raw, start) {
                candidates.push(&raw[start..=end]);
            }
        }
    }

    candidates
}

/// Byte index of the `}` closing the `{` at `start`, skipping braces inside
/// JSON strings.
fn matching_brace(raw: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }

    None
}

/* ──────────────────────────────────────────────────────────────── */

/// Shape-checked but not yet repaired.
struct ParsedResult {
    total_questions: u32,
    correct_answers: u32,
    incorrect_answers: u32,
    grade: String,
    percentage: u64,
    feedback: String,
    question_analysis: Vec<QuestionAnalysis>,
}

fn parse_schema(value: &Value) -> Option<ParsedResult> {
    let object = value.as_object()?;

    let question_analysis = object
        .get("questionAnalysis")?
        .as_array()?
        .iter()
        .map(parse_question)
        .collect::<Option<Vec<_>>>()?;

    Some(ParsedResult {
        total_questions: count_field(object, "totalQuestions")?,
        correct_answers: count_field(object, "correctAnswers")?,
        incorrect_answers: count_field(object, "incorrectAnswers")?,
        grade: object.get("grade")?.as_str()?.to_string(),
        percentage: rounded_percentage(object.get("percentage")?)?,
        feedback: object.get("feedback")?.as_str()?.to_string(),
        question_analysis,
    })
}

fn parse_question(value: &Value) -> Option<QuestionAnalysis> {
    let object = value.as_object()?;
    Some(QuestionAnalysis {
        question_number: count_field(object, "questionNumber")?,
        is_correct: object.get("isCorrect")?.as_bool()?,
        feedback: object.get("feedback")?.as_str()?.to_string(),
    })
}

fn count_field(object: &Map<String, Value>, key: &str) -> Option<u32> {
    u32::try_from(non_negative_integer(object.get(key)?)?).ok()
}

/// Accepts `4` and `4.0`, rejects negatives, fractions and strings.
fn non_negative_integer(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then_some(f as u64)
}

/// Like [`non_negative_integer`] but rounds fractions, so `66.67` becomes 67.
fn rounded_percentage(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if !(f >= 0.0 && f.is_finite()) {
        return None;
    }
    let rounded = f.round();
    if rounded != f {
        warn!("Fractional percentage {}; rounding to {}", f, rounded);
    }
    Some(rounded.min(u64::MAX as f64) as u64)
}

/// `None` when the counts overflow or exceed [`MAX_QUESTIONS`].
fn repair(parsed: ParsedResult) -> Option<AnalysisResult> {
    let ParsedResult {
        mut total_questions,
        correct_answers,
        incorrect_answers,
        grade,
        percentage,
        mut feedback,
        mut question_analysis,
    } = parsed;

    let sum = correct_answers.checked_add(incorrect_answers)?;
    if sum > MAX_QUESTIONS {
        return None;
    }
    if sum != total_questions {
        warn!(
            "Result totals disagree (total {}, correct {}, incorrect {}); using {}",
            total_questions, correct_answers, incorrect_answers, sum
        );
        total_questions = sum;
    }

    let expected = total_questions as usize;
    if question_analysis.len() != expected {
        warn!(
            "Result lists {} question entries for {} questions; {}",
            question_analysis.len(),
            expected,
            if question_analysis.len() > expected {
                "truncating"
            } else {
                "padding"
            }
        );
        question_analysis.truncate(expected);
        while question_analysis.len() < expected {
            question_analysis.push(QuestionAnalysis {
                question_number: question_analysis.len() as u32 + 1,
                is_correct: false,
                feedback: NOT_ANALYZED_FEEDBACK.to_string(),
            });
        }
    }

    for (index, entry) in question_analysis.iter_mut().enumerate() {
        if entry.question_number == 0 {
            warn!("Question entry {} has number 0; renumbering", index + 1);
            entry.question_number = index as u32 + 1;
        }
    }

    let percentage = if percentage > 100 {
        warn!("Percentage {} out of range; clamping to 100", percentage);
        100
    } else {
        percentage as u8
    };

    let grade = match Grade::parse(&grade) {
        Some(parsed) => parsed,
        None => {
            let derived = Grade::for_percentage(percentage);
            warn!(
                "Unrecognised grade '{}'; using {} from percentage",
                grade, derived
            );
            derived
        }
    };

    if feedback.trim().is_empty() {
        warn!("Result has no overall feedback");
        feedback = MISSING_FEEDBACK_MESSAGE.to_string();
    }

    Some(AnalysisResult {
        total_questions,
        correct_answers,
        incorrect_answers,
        grade,
        percentage,
        feedback,
        question_analysis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_A: &str = r#"Here is the grading: {"totalQuestions":5,"correctAnswers":4,"incorrectAnswers":1,"grade":"B+","percentage":80,"feedback":"Good job","questionAnalysis":[{"questionNumber":1,"isCorrect":true,"feedback":"ok"},{"questionNumber":2,"isCorrect":true,"feedback":"ok"},{"questionNumber":3,"isCorrect":false,"feedback":"check PEMDAS"},{"questionNumber":4,"isCorrect":true,"feedback":"ok"},{"questionNumber":5,"isCorrect":true,"feedback":"ok"}]}"#;

    fn assert_degraded(result: &AnalysisResult) {
        assert_eq!(result.total_questions, 1);
        assert_eq!(result.correct_answers, 0);
        assert_eq!(result.incorrect_answers, 1);
        assert_eq!(result.grade, Grade::NotAvailable);
        assert_eq!(result.percentage, 0);
        assert_eq!(result.question_analysis.len(), 1);
        assert!(!result.question_analysis[0].is_correct);
    }

    #[test]
    fn embedded_object_is_returned_exactly() {
        let result = normalize(SCENARIO_A);
        let start = SCENARIO_A.find('{').unwrap();
        let expected: AnalysisResult = serde_json::from_str(&SCENARIO_A[start..]).unwrap();
        assert_eq!(result, expected);
        assert_eq!(result.grade, Grade::BPlus);
        assert_eq!(result.question_analysis[2].feedback, "check PEMDAS");
    }

    #[test]
    fn valid_results_are_unchanged() {
        for scenario in crate::backends::local::scenarios() {
            let raw = serde_json::to_string(scenario).unwrap();
            assert_eq!(&normalize(&raw), scenario);
        }
    }

    #[test]
    fn prose_becomes_degraded_result_with_verbatim_feedback() {
        let raw = "I could not identify any problems.";
        let result = normalize(raw);
        assert_degraded(&result);
        assert_eq!(result.feedback, raw);
        assert_eq!(result.question_analysis[0].feedback, raw);
    }

    #[test]
    fn empty_output_uses_fixed_message() {
        for raw in ["", "   \n"] {
            let result = normalize(raw);
            assert_degraded(&result);
            assert_eq!(result.feedback, UNABLE_TO_ANALYZE_MESSAGE);
        }
    }

    #[test]
    fn missing_fields_fall_back() {
        let raw = r#"{"totalQuestions":2,"correctAnswers":1,"incorrectAnswers":1,"grade":"C"}"#;
        let result = normalize(raw);
        assert_degraded(&result);
        assert_eq!(result.feedback, raw);
    }

    #[test]
    fn wrong_types_fall_back() {
        let raw = r#"{"totalQuestions":"two","correctAnswers":1,"incorrectAnswers":1,"grade":"C","percentage":50,"feedback":"x","questionAnalysis":[]}"#;
        assert_degraded(&normalize(raw));

        let negative = r#"{"totalQuestions":1,"correctAnswers":-1,"incorrectAnswers":2,"grade":"C","percentage":50,"feedback":"x","questionAnalysis":[]}"#;
        assert_degraded(&normalize(negative));
    }

    #[test]
    fn totals_are_recomputed_from_parts() {
        let raw = r#"{"totalQuestions":10,"correctAnswers":2,"incorrectAnswers":1,"grade":"D","percentage":67,"feedback":"Keep going","questionAnalysis":[{"questionNumber":1,"isCorrect":true,"feedback":"ok"},{"questionNumber":2,"isCorrect":true,"feedback":"ok"},{"questionNumber":3,"isCorrect":false,"feedback":"no"}]}"#;
        let result = normalize(raw);
        assert_eq!(result.total_questions, 3);
        assert!(result.satisfies_invariants());
        assert_eq!(result.question_analysis.len(), 3);
    }

    #[test]
    fn short_question_list_is_padded() {
        let raw = r#"{"totalQuestions":3,"correctAnswers":2,"incorrectAnswers":1,"grade":"B","percentage":67,"feedback":"Fine","questionAnalysis":[{"questionNumber":1,"isCorrect":true,"feedback":"ok"}]}"#;
        let result = normalize(raw);
        assert!(result.satisfies_invariants());
        assert_eq!(result.question_analysis[1].question_number, 2);
        assert!(!result.question_analysis[2].is_correct);
        assert_eq!(result.question_analysis[2].feedback, NOT_ANALYZED_FEEDBACK);
    }

    #[test]
    fn long_question_list_is_truncated() {
        let raw = r#"{"totalQuestions":1,"correctAnswers":1,"incorrectAnswers":0,"grade":"A+","percentage":100,"feedback":"Great","questionAnalysis":[{"questionNumber":1,"isCorrect":true,"feedback":"ok"},{"questionNumber":2,"isCorrect":true,"feedback":"extra"}]}"#;
        let result = normalize(raw);
        assert!(result.satisfies_invariants());
        assert_eq!(result.question_analysis.len(), 1);
    }

    #[test]
    fn out_of_range_values_are_repaired() {
        let raw = r#"{"totalQuestions":1,"correctAnswers":1,"incorrectAnswers":0,"grade":"A-","percentage":140,"feedback":"","questionAnalysis":[{"questionNumber":0,"isCorrect":true,"feedback":"ok"}]}"#;
        let result = normalize(raw);
        assert_eq!(result.percentage, 100);
        assert_eq!(result.grade, Grade::APlus);
        assert_eq!(result.feedback, MISSING_FEEDBACK_MESSAGE);
        assert_eq!(result.question_analysis[0].question_number, 1);
        assert!(result.satisfies_invariants());
    }

    #[test]
    fn fenced_block_and_braces_in_strings() {
        let raw = "Sure!\n```json\n{\"totalQuestions\":1,\"correctAnswers\":0,\"incorrectAnswers\":1,\"grade\":\"F\",\"percentage\":0,\"feedback\":\"Use {x} carefully\",\"questionAnalysis\":[{\"questionNumber\":1,\"isCorrect\":false,\"feedback\":\"set {1,2}\"}]}\n```\nGood luck.";
        let result = normalize(raw);
        assert_eq!(result.grade, Grade::F);
        assert_eq!(result.feedback, "Use {x} carefully");
        assert_eq!(result.question_analysis[0].feedback, "set {1,2}");
    }

    #[test]
    fn skips_unrelated_objects_before_the_result() {
        let raw = r#"Note {"confidence": 0.9} then {"totalQuestions":1,"correctAnswers":1,"incorrectAnswers":0,"grade":"A","percentage":95,"feedback":"Nice","questionAnalysis":[{"questionNumber":1,"isCorrect":true,"feedback":"ok"}]}"#;
        let result = normalize(raw);
        assert_eq!(result.grade, Grade::A);
        assert_eq!(result.percentage, 95);
    }

    #[test]
    fn integral_floats_are_accepted() {
        let raw = r#"{"totalQuestions":1.0,"correctAnswers":1,"incorrectAnswers":0,"grade":"A","percentage":95.0,"feedback":"Nice","questionAnalysis":[{"questionNumber":1,"isCorrect":true,"feedback":"ok"}]}"#;
        assert_eq!(normalize(raw).total_questions, 1);
    }

    #[test]
    fn overflowing_counts_fall_back() {
        let raw = r#"{"totalQuestions":1,"correctAnswers":4294967295,"incorrectAnswers":1,"grade":"B","percentage":80,"feedback":"x","questionAnalysis":[]}"#;
        let result = normalize(raw);
        assert_degraded(&result);
        assert!(result.satisfies_invariants());
    }

    #[test]
    fn huge_counts_fall_back_without_padding() {
        let raw = r#"{"totalQuestions":5000000,"correctAnswers":5000000,"incorrectAnswers":0,"grade":"A+","percentage":100,"feedback":"x","questionAnalysis":[]}"#;
        let result = normalize(raw);
        assert_degraded(&result);
        assert_eq!(result.question_analysis.len(), 1);
    }

    #[test]
    fn counts_at_the_limit_are_padded() {
        let raw = format!(
            r#"{{"totalQuestions":{0},"correctAnswers":{0},"incorrectAnswers":0,"grade":"A+","percentage":100,"feedback":"x","questionAnalysis":[]}}"#,
            MAX_QUESTIONS
        );
        let result = normalize(&raw);
        assert_eq!(result.question_analysis.len(), MAX_QUESTIONS as usize);
        assert!(result.satisfies_invariants());
    }

    #[test]
    fn fractional_percentage_is_rounded() {
        let raw = r#"{"totalQuestions":3,"correctAnswers":2,"incorrectAnswers":1,"grade":"D+","percentage":66.67,"feedback":"Close","questionAnalysis":[{"questionNumber":1,"isCorrect":true,"feedback":"ok"},{"questionNumber":2,"isCorrect":true,"feedback":"ok"},{"questionNumber":3,"isCorrect":false,"feedback":"no"}]}"#;
        let result = normalize(raw);
        assert_eq!(result.percentage, 67);
        assert_eq!(result.grade, Grade::DPlus);
        assert_eq!(result.feedback, "Close");
    }

    #[test]
    fn unbalanced_braces_fall_back() {
        let raw = r#"{"totalQuestions":1, "feedback": "cut off"#;
        let result = normalize(raw);
        assert_degraded(&result);
        assert_eq!(result.feedback, raw);
    }
}
