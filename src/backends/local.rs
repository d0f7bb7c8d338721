use super::{AnalysisError, RawResponse};
use crate::analysis_types::{AnalysisResult, Grade, QuestionAnalysis};
use crate::camera_toolkit::EncodedImage;
use crate::settings::AppSettings;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

fn question(number: u32, is_correct: bool, feedback: &str) -> QuestionAnalysis {
    QuestionAnalysis {
        question_number: number,
        is_correct,
        feedback: feedback.to_string(),
    }
}

/// Canned demo results: partial credit, a weaker attempt, and a perfect score.
static SCENARIOS: Lazy<Vec<AnalysisResult>> = Lazy::new(|| {
    vec![
        AnalysisResult {
            total_questions: 5,
            correct_answers: 4,
            incorrect_answers: 1,
            grade: Grade::BPlus,
            percentage: 80,
            feedback: "Great work! Most answers are right. Watch the order of operations in problem 3.".to_string(),
            question_analysis: vec![
                question(1, true, "Correct, 2 + 3 = 5."),
                question(2, true, "Correct, 12 ÷ 4 = 3."),
                question(3, false, "Multiply before adding: 2 + 3 × 4 = 2 + 12 = 14, not 20."),
                question(4, true, "Correct, 15 - 8 = 7."),
                question(5, true, "Correct, 6 × 7 = 42."),
            ],
        },
        AnalysisResult {
            total_questions: 3,
            correct_answers: 2,
            incorrect_answers: 1,
            grade: Grade::B,
            percentage: 67,
            feedback: "Good effort. Basic arithmetic is solid; review multiplying fractions.".to_string(),
            question_analysis: vec![
                question(1, true, "Correct, 1/2 + 1/4 = 2/4 + 1/4 = 3/4."),
                question(2, false, "3/5 × 2/3 = 6/15 = 2/5, not 1/2."),
                question(3, true, "Correct, 8 - 3.5 = 4.5."),
            ],
        },
        AnalysisResult {
            total_questions: 4,
            correct_answers: 4,
            incorrect_answers: 0,
            grade: Grade::APlus,
            percentage: 100,
            feedback: "Outstanding! Every problem is solved correctly with clear working.".to_string(),
            question_analysis: vec![
                question(1, true, "Your algebra is spot on."),
                question(2, true, "Nicely solved for x = 5."),
                question(3, true, "Geometry calculation is correct."),
                question(4, true, "Clear, well organised approach."),
            ],
        },
    ]
});

pub fn scenarios() -> &'static [AnalysisResult] {
    &SCENARIOS
}

/// Offline stand-in that returns a canned result. It does not grade anything.
pub struct LocalSimulatedBackend {
    rng: Mutex<StdRng>,
    latency: Duration,
}

impl LocalSimulatedBackend {
    pub fn new(seed: Option<u64>, latency: Duration) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            latency,
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Self {
        Self::new(settings.simulation_seed, settings.simulated_latency())
    }

    fn pick_scenario(&self) -> &'static AnalysisResult {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = rng.gen_range(0..SCENARIOS.len());
        &SCENARIOS[index]
    }

    pub async fn analyze(&self, image: &EncodedImage) -> Result<RawResponse, AnalysisError> {
        // Decoding is CPU-bound; keep it off the async runtime.
        let still = image.clone();
        match tokio::task::spawn_blocking(move || plausibility(&still)).await {
            Ok(Some(signal)) => debug!(
                "Image plausibility: {}x{}, ink coverage {:.1}%",
                signal.width,
                signal.height,
                signal.ink_ratio * 100.0
            ),
            Ok(None) => {}
            Err(e) => warn!("Plausibility check did not complete: {}", e),
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scenario = self.pick_scenario();
        info!(
            "Simulated analysis returned a {}/{} scenario",
            scenario.correct_answers, scenario.total_questions
        );

        serde_json::to_string(scenario).map_err(|e| {
            AnalysisError::BackendRejected(format!("Failed to serialize scenario: {}", e))
        })
    }
}

/// Cheap look at the picture. Logged only, never changes the canned content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plausibility {
    pub width: u32,
    pub height: u32,
    /// Share of dark pixels, a rough hint that something is written on the page.
    pub ink_ratio: f32,
}

const INK_LUMA_THRESHOLD: u8 = 96;

/// Longest edge sampled for the ink estimate.
const SAMPLE_EDGE: u32 = 256;

pub fn plausibility(image: &EncodedImage) -> Option<Plausibility> {
    let decoded = match image::load_from_memory(image.bytes()) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Could not decode image for plausibility check: {}", e);
            return None;
        }
    };

    let (width, height) = (decoded.width(), decoded.height());
    let sample = if width > SAMPLE_EDGE || height > SAMPLE_EDGE {
        decoded.thumbnail(SAMPLE_EDGE, SAMPLE_EDGE)
    } else {
        decoded
    };

    let luma = sample.to_luma8();
    let total = luma.pixels().len();
    if total == 0 {
        return None;
    }
    let dark = luma
        .pixels()
        .filter(|pixel| pixel.0[0] < INK_LUMA_THRESHOLD)
        .count();

    Some(Plausibility {
        width,
        height,
        ink_ratio: dark as f32 / total as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_toolkit::{encode_jpeg, ImageSource};
    use image::RgbImage;

    fn blank_image() -> EncodedImage {
        EncodedImage::new(Vec::new(), "image/png", ImageSource::File)
    }

    #[test]
    fn corpus_covers_required_cases_and_invariants() {
        let corpus = scenarios();
        assert!(corpus.len() >= 3);
        assert!(corpus.iter().all(AnalysisResult::satisfies_invariants));
        assert!(corpus.iter().any(|s| s.percentage == 100));
        assert!(corpus
            .iter()
            .any(|s| s.correct_answers > 0 && s.incorrect_answers > 0));
        let lowest = corpus.iter().map(|s| s.percentage).min().unwrap();
        assert!(lowest < 80);
    }

    #[tokio::test]
    async fn returns_serialized_scenario() {
        let backend = LocalSimulatedBackend::new(Some(7), Duration::ZERO);
        let raw = backend.analyze(&blank_image()).await.unwrap();
        let parsed: AnalysisResult = serde_json::from_str(&raw).unwrap();
        assert!(scenarios().contains(&parsed));
    }

    #[tokio::test]
    async fn same_seed_same_sequence() {
        let first = LocalSimulatedBackend::new(Some(42), Duration::ZERO);
        let second = LocalSimulatedBackend::new(Some(42), Duration::ZERO);
        for _ in 0..5 {
            assert_eq!(
                first.analyze(&blank_image()).await.unwrap(),
                second.analyze(&blank_image()).await.unwrap()
            );
        }
    }

    #[test]
    fn plausibility_measures_ink() {
        let mut frame = RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255]));
        for x in 0..10 {
            frame.put_pixel(x, 0, image::Rgb([0, 0, 0]));
        }
        let still = encode_jpeg(&frame, 100).unwrap();
        let signal = plausibility(&still).unwrap();
        assert_eq!((signal.width, signal.height), (10, 10));
        assert!(signal.ink_ratio > 0.0 && signal.ink_ratio < 0.5);
    }

    #[test]
    fn large_image_is_sampled_but_reports_full_size() {
        let mut frame = RgbImage::from_pixel(1024, 800, image::Rgb([255, 255, 255]));
        for y in 0..400 {
            for x in 0..1024 {
                frame.put_pixel(x, y, image::Rgb([0, 0, 0]));
            }
        }
        let still = encode_jpeg(&frame, 90).unwrap();
        let signal = plausibility(&still).unwrap();
        assert_eq!((signal.width, signal.height), (1024, 800));
        assert!(signal.ink_ratio > 0.4 && signal.ink_ratio < 0.6);
    }

    #[test]
    fn undecodable_image_has_no_signal() {
        assert_eq!(plausibility(&blank_image()), None);
    }
}
