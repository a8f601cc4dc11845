//! 校验引擎
//!
//! 四类相互独立的检查：不可能结果、模式一致性、几何偏差、干扰。
//! 模式与干扰需要整份文档的答案集合，所以在层级结果合并之后统一运行。

use crate::config::PipelineConfig;
use crate::models::answer::{BubbleQuality, ExtractedAnswer, QuestionType};
use crate::models::validation::{FindingKind, Severity, ValidationFinding, ValidationReport};

/// 低于该置信度视为受干扰
pub const INTERFERENCE_CONFIDENCE: f32 = 0.5;

/// 校验参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSettings {
    pub geometric_max_deviation: f32,
    pub min_fill_confidence: f32,
    pub pattern_anomaly_threshold: f32,
    pub interference_warning_threshold: f32,
    pub interference_critical_threshold: f32,
}

impl From<&PipelineConfig> for ValidationSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            geometric_max_deviation: config.geometric_max_deviation,
            min_fill_confidence: config.min_fill_confidence,
            pattern_anomaly_threshold: config.pattern_anomaly_threshold,
            interference_warning_threshold: config.interference_warning_threshold,
            interference_critical_threshold: config.interference_critical_threshold,
        }
    }
}

/// 校验引擎
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    settings: ValidationSettings,
    valid_answers: Vec<String>,
}

impl ValidationEngine {
    pub fn new(settings: ValidationSettings, valid_answers: Vec<String>) -> Self {
        Self {
            settings,
            valid_answers,
        }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    /// 校验整份文档的答案
    pub fn validate(&self, answers: &[ExtractedAnswer]) -> ValidationReport {
        let mut findings = Vec::new();
        for answer in answers {
            findings.extend(self.validate_question(answer));
        }

        let choices: Vec<&ExtractedAnswer> = answers
            .iter()
            .filter(|a| a.question_type == QuestionType::MultipleChoice)
            .collect();
        let anomalous = choices.iter().filter(|a| self.is_pattern_anomaly(a)).count();
        let anomaly_rate = ratio(anomalous, choices.len());
        findings.push(self.pattern_finding(anomalous, choices.len(), anomaly_rate));

        let interfered = answers.iter().filter(|a| self.is_interfered(a)).count();
        let interference_rate = ratio(interfered, answers.len());
        findings.push(self.interference_finding(interfered, answers.len(), interference_rate));

        let requires_reprocessing = findings
            .iter()
            .any(|f| f.fallback_required || (f.kind == FindingKind::Impossibility && !f.passed));

        ValidationReport {
            findings,
            requires_reprocessing,
            anomaly_rate,
            interference_rate,
        }
    }

    /// 单题校验：不可能结果 + 几何偏差
    pub fn validate_question(&self, answer: &ExtractedAnswer) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        if answer.question_type == QuestionType::MultipleChoice {
            findings.push(self.impossibility_finding(answer));
        }
        for (index, attributed) in answer.marks.iter().enumerate() {
            findings.push(self.geometric_finding(answer.question_number, index, attributed.deviation));
        }
        findings
    }

    /// 单题是否通过（含文字长度）
    pub fn question_passed(&self, answer: &ExtractedAnswer) -> bool {
        answer.format_valid && self.validate_question(answer).iter().all(|f| f.passed)
    }

    fn impossibility_finding(&self, answer: &ExtractedAnswer) -> ValidationFinding {
        let q = Some(answer.question_number);
        if answer.multiple_marks {
            let options: Vec<String> = answer
                .marks
                .iter()
                .map(|m| {
                    self.valid_answers
                        .get(m.column as usize)
                        .cloned()
                        .unwrap_or_else(|| format!("#{}", m.column))
                })
                .collect();
            return ValidationFinding::failed(
                FindingKind::Impossibility,
                q,
                Severity::Critical,
                format!("同时填涂了 {} 个选项: {}", answer.marks.len(), options.join(", ")),
            )
            .with_fallback(true);
        }
        if let Some(value) = &answer.value {
            if !self.valid_answers.is_empty() && !self.valid_answers.contains(value) {
                return ValidationFinding::failed(
                    FindingKind::Impossibility,
                    q,
                    Severity::Critical,
                    format!("答案 {} 不在有效选项中", value),
                )
                .with_fallback(true);
            }
            if answer.confidence < self.settings.min_fill_confidence {
                return ValidationFinding::failed(
                    FindingKind::Impossibility,
                    q,
                    Severity::Warning,
                    format!("置信度 {:.2} 低于最低填涂阈值", answer.confidence),
                )
                .with_confidence(answer.confidence);
            }
        }
        ValidationFinding::passed(FindingKind::Impossibility, q, "单一有效答案")
    }

    fn geometric_finding(&self, question_number: u32, index: usize, deviation: f32) -> ValidationFinding {
        let max = self.settings.geometric_max_deviation;
        let q = Some(question_number);
        let details = format!("第 {} 个墨迹偏差 {:.1} px（上限 {:.1}）", index + 1, deviation, max);
        if deviation <= max {
            return ValidationFinding::passed(FindingKind::Geometric, q, details);
        }
        let fallback = deviation > 2.0 * max;
        let severity = if fallback { Severity::Critical } else { Severity::Warning };
        let mut finding = ValidationFinding::failed(FindingKind::Geometric, q, severity, details)
            .with_fallback(fallback)
            .with_confidence(max / deviation);
        finding.correction_suggested = deviation > 1.5 * max;
        finding
    }

    /// 散乱（多选或偏差过大）或填涂不完整
    pub fn is_pattern_anomaly(&self, answer: &ExtractedAnswer) -> bool {
        answer.multiple_marks
            || answer
                .max_deviation()
                .map_or(false, |d| d > self.settings.geometric_max_deviation)
            || answer.bubble_quality == BubbleQuality::Light
    }

    /// 置信度过低或与手写区域重叠
    pub fn is_interfered(&self, answer: &ExtractedAnswer) -> bool {
        answer.confidence < INTERFERENCE_CONFIDENCE || answer.handwriting_overlap
    }

    fn pattern_finding(&self, anomalous: usize, total: usize, rate: f32) -> ValidationFinding {
        let details = format!("{}/{} 道选择题模式异常 ({:.0}%)", anomalous, total, rate * 100.0);
        if total > 0 && rate >= self.settings.pattern_anomaly_threshold {
            ValidationFinding::failed(FindingKind::Pattern, None, Severity::Warning, details)
                .with_confidence(1.0 - rate)
        } else {
            ValidationFinding::passed(FindingKind::Pattern, None, details)
        }
    }

    fn interference_finding(&self, interfered: usize, total: usize, rate: f32) -> ValidationFinding {
        let details = format!("{}/{} 道题受干扰 ({:.0}%)", interfered, total, rate * 100.0);
        if rate > self.settings.interference_critical_threshold {
            ValidationFinding::failed(FindingKind::Interference, None, Severity::Critical, details)
                .with_fallback(true)
                .with_confidence(1.0 - rate)
        } else if rate >= self.settings.interference_warning_threshold {
            ValidationFinding::failed(FindingKind::Interference, None, Severity::Warning, details)
                .with_confidence(1.0 - rate)
        } else {
            ValidationFinding::passed(FindingKind::Interference, None, details)
        }
    }
}

fn ratio(part: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        part as f32 / total as f32
    }
}
