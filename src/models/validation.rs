use serde::{Deserialize, Serialize};

/// 校验类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Impossibility,
    Pattern,
    Geometric,
    Interference,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::Impossibility => "impossibility",
            FindingKind::Pattern => "pattern",
            FindingKind::Geometric => "geometric",
            FindingKind::Interference => "interference",
        }
    }
}

/// 严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// 一条校验结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub kind: FindingKind,
    /// None 表示文档级结论
    pub question_number: Option<u32>,
    pub passed: bool,
    pub severity: Severity,
    pub confidence: f32,
    pub details: String,
    pub correction_suggested: bool,
    pub fallback_required: bool,
}

impl ValidationFinding {
    pub fn passed(kind: FindingKind, question_number: Option<u32>, details: impl Into<String>) -> Self {
        Self {
            kind,
            question_number,
            passed: true,
            severity: Severity::Info,
            confidence: 1.0,
            details: details.into(),
            correction_suggested: false,
            fallback_required: false,
        }
    }

    pub fn failed(
        kind: FindingKind,
        question_number: Option<u32>,
        severity: Severity,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            question_number,
            passed: false,
            severity,
            confidence: 1.0,
            details: details.into(),
            correction_suggested: false,
            fallback_required: false,
        }
    }

    pub fn with_fallback(mut self, fallback_required: bool) -> Self {
        self.fallback_required = fallback_required;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = crate::models::geometry::clamp_unit(confidence);
        self
    }

    pub fn is_document_level(&self) -> bool {
        self.question_number.is_none()
    }
}

/// 一批答案的校验报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<ValidationFinding>,
    pub requires_reprocessing: bool,
    /// 选择题中模式异常的比例
    pub anomaly_rate: f32,
    /// 全部题目中受干扰的比例
    pub interference_rate: f32,
}

impl ValidationReport {
    /// 某题的全部结论
    pub fn for_question(&self, question_number: u32) -> impl Iterator<Item = &ValidationFinding> {
        self.findings
            .iter()
            .filter(move |f| f.question_number == Some(question_number))
    }

    /// 文档级结论
    pub fn document_finding(&self, kind: FindingKind) -> Option<&ValidationFinding> {
        self.findings
            .iter()
            .find(|f| f.kind == kind && f.is_document_level())
    }

    /// 文档级某类结论是否失败
    pub fn document_failed(&self, kind: FindingKind) -> bool {
        self.document_finding(kind).map(|f| !f.passed).unwrap_or(false)
    }

    /// 所有结论的通过率（无结论视为 1.0）
    pub fn pass_rate(&self) -> f32 {
        if self.findings.is_empty() {
            return 1.0;
        }
        let passed = self.findings.iter().filter(|f| f.passed).count();
        passed as f32 / self.findings.len() as f32
    }
}
