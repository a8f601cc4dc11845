//! 复杂度分析
//!
//! 每道题根据初始提取结果打分，分数决定走 cheap 还是 expensive 层级。

use crate::models::answer::{BubbleQuality, ExtractedAnswer, QuestionType};
use crate::models::routing::{ComplexityScore, ContributingFactor, ProcessingTier};

/// 分数不超过该值走 cheap 层级
pub const CHEAP_TIER_MAX_SCORE: f32 = 25.0;

/// 题型附加分
pub fn type_penalty(question_type: QuestionType) -> f32 {
    match question_type {
        QuestionType::Essay => 40.0,
        QuestionType::Text => 25.0,
        QuestionType::Unknown => 15.0,
        QuestionType::MultipleChoice => 0.0,
    }
}

/// 答案清晰度 [0, 100]
pub fn answer_clarity(answer: &ExtractedAnswer) -> f32 {
    let mut clarity = answer.confidence * 100.0;
    match answer.bubble_quality {
        BubbleQuality::Heavy => clarity += 10.0,
        BubbleQuality::Medium => clarity += 5.0,
        BubbleQuality::Empty | BubbleQuality::Overfilled => clarity -= 20.0,
        _ => {}
    }
    if answer.cross_validated {
        clarity += 10.0;
    }
    clarity.clamp(0.0, 100.0)
}

/// 计算单题复杂度
pub fn analyze(answer: &ExtractedAnswer) -> ComplexityScore {
    let ec = answer.confidence * 100.0;
    let clarity = answer_clarity(answer);
    let mut factors = Vec::new();
    let mut push = |name: &str, points: f32| {
        if points != 0.0 {
            factors.push(ContributingFactor {
                name: name.to_string(),
                points,
            });
        }
    };

    push("extraction_confidence", (100.0 - ec) * 0.3);
    push("answer_clarity", (100.0 - clarity) * 0.25);
    if answer.multiple_marks {
        push("multiple_marks", 30.0);
    }
    if answer.review_flag {
        push("review_flag", 25.0);
    }
    if !answer.cross_validated {
        push("not_cross_validated", 15.0);
    }
    match answer.bubble_quality {
        BubbleQuality::Empty | BubbleQuality::Overfilled => push("bubble_quality", 20.0),
        BubbleQuality::Unknown => push("bubble_quality", 10.0),
        _ => {}
    }
    push("question_type", type_penalty(answer.question_type));
    if answer.value.is_none() {
        push("no_value", 20.0);
    } else if !answer.format_valid {
        push("invalid_format", 15.0);
    }

    let score = factors.iter().map(|f| f.points).sum::<f32>().clamp(0.0, 100.0);
    let recommended_tier = if score <= CHEAP_TIER_MAX_SCORE {
        ProcessingTier::Cheap
    } else {
        ProcessingTier::Expensive
    };

    ComplexityScore {
        question_number: answer.question_number,
        score,
        recommended_tier,
        decision_confidence: decision_confidence(answer, score, ec),
        contributing_factors: factors,
    }
}

fn decision_confidence(answer: &ExtractedAnswer, score: f32, ec: f32) -> f32 {
    let mut confidence = 80.0;
    if score <= 20.0 || score >= 80.0 {
        confidence += 15.0;
    }
    if (40.0..=60.0).contains(&score) {
        confidence -= 20.0;
    }
    if answer.cross_validated && ec > 85.0 {
        confidence += 10.0;
    }
    if answer.multiple_marks || answer.review_flag {
        confidence += 10.0;
    }
    if matches!(answer.bubble_quality, BubbleQuality::Heavy | BubbleQuality::Medium) {
        confidence += 5.0;
    }
    f32::clamp(confidence, 50.0, 100.0)
}

/// 批量计算
pub fn analyze_all(answers: &[ExtractedAnswer]) -> Vec<ComplexityScore> {
    answers.iter().map(analyze).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::answer::ExtractionMethod;

    fn clean_choice() -> ExtractedAnswer {
        let mut answer = ExtractedAnswer::empty(1, QuestionType::MultipleChoice, ExtractionMethod::TemplateAware)
            .with_confidence(0.95);
        answer.value = Some("B".to_string());
        answer.cross_validated = true;
        answer.bubble_quality = BubbleQuality::Heavy;
        answer
    }

    #[test]
    fn clean_choice_goes_cheap() {
        let score = analyze(&clean_choice());
        assert!((score.score - 1.5).abs() < 1e-3);
        assert_eq!(score.recommended_tier, ProcessingTier::Cheap);
        assert_eq!(score.decision_confidence, 100.0);
    }

    #[test]
    fn multi_mark_question_goes_expensive() {
        let mut answer = clean_choice().with_confidence(0.45);
        answer.value = None;
        answer.multiple_marks = true;
        answer.cross_validated = false;
        let score = analyze(&answer);
        assert_eq!(score.recommended_tier, ProcessingTier::Expensive);
        assert!(score.contributing_factors.iter().any(|f| f.name == "multiple_marks"));
        assert!(score.score > 80.0);
    }

    #[test]
    fn essay_penalty_dominates() {
        let mut answer = ExtractedAnswer::empty(9, QuestionType::Essay, ExtractionMethod::TextRecognition)
            .with_confidence(1.0);
        answer.value = Some("a reasonably long essay answer".to_string());
        let score = analyze(&answer);
        // 0 + 0 + 15（未交叉验证）+ 40
        assert!((score.score - 55.0).abs() < 1e-3);
        assert_eq!(score.decision_confidence, 60.0);
    }

    #[test]
    fn scores_stay_in_range() {
        let mut answer = ExtractedAnswer::empty(2, QuestionType::Essay, ExtractionMethod::TextRecognition);
        answer.review_flag = true;
        answer.multiple_marks = true;
        answer.bubble_quality = BubbleQuality::Overfilled;
        let score = analyze(&answer);
        assert_eq!(score.score, 100.0);
        assert!((50.0..=100.0).contains(&score.decision_confidence));
    }
}
