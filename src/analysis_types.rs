use serde::{Deserialize, Serialize};
use std::fmt;

/// Letter grade attached to an analysis. `NotAvailable` is reserved for results the
/// backend could not produce a real grade for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "F")]
    F,
    #[serde(rename = "N/A")]
    NotAvailable,
}

impl Grade {
    pub const ALL: [Grade; 10] = [
        Grade::APlus,
        Grade::A,
        Grade::BPlus,
        Grade::B,
        Grade::CPlus,
        Grade::C,
        Grade::DPlus,
        Grade::D,
        Grade::F,
        Grade::NotAvailable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::DPlus => "D+",
            Grade::D => "D",
            Grade::F => "F",
            Grade::NotAvailable => "N/A",
        }
    }

    pub fn parse(value: &str) -> Option<Grade> {
        let trimmed = value.trim();
        Grade::ALL
            .iter()
            .copied()
            .find(|grade| grade.as_str().eq_ignore_ascii_case(trimmed))
    }

    /// Conventional US letter-grade bands.
    pub fn for_percentage(percentage: u8) -> Grade {
        match percentage {
            97..=100 => Grade::APlus,
            93..=96 => Grade::A,
            87..=92 => Grade::BPlus,
            80..=86 => Grade::B,
            77..=79 => Grade::CPlus,
            70..=76 => Grade::C,
            67..=69 => Grade::DPlus,
            60..=66 => Grade::D,
            _ => Grade::F,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAnalysis {
    pub question_number: u32,
    pub is_correct: bool,
    pub feedback: String,
}

/// Canonical grading result handed to the presentation layer.
///
/// Anything built by [`crate::normalizer::normalize`] satisfies
/// `correct_answers + incorrect_answers == total_questions` and
/// `question_analysis.len() == total_questions`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub total_questions: u32,
    pub correct_answers: u32,
    pub incorrect_answers: u32,
    pub grade: Grade,
    pub percentage: u8,
    pub feedback: String,
    pub question_analysis: Vec<QuestionAnalysis>,
}

impl AnalysisResult {
    pub fn satisfies_invariants(&self) -> bool {
        self.correct_answers as u64 + self.incorrect_answers as u64
            == self.total_questions as u64
            && self.question_analysis.len() == self.total_questions as usize
            && self.percentage <= 100
            && !self.feedback.is_empty()
    }
}
