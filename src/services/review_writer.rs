//! 人工复核写入服务
//!
//! 只负责把需要人工复核的题目追加到复核文件，不关心流程

use crate::models::output::FinalAnswerRecord;
use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;
use tracing::debug;

/// 人工复核写入服务
pub struct ReviewWriter {
    review_file_path: String,
}

impl ReviewWriter {
    /// 使用默认文件 review.txt
    pub fn new() -> Self {
        Self {
            review_file_path: "review.txt".to_string(),
        }
    }

    /// 使用自定义文件路径创建
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            review_file_path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.review_file_path
    }

    /// 追加一份文档中需要人工复核的题目
    ///
    /// # 参数
    /// - `document`: 文档名
    /// - `records`: 该文档的全部最终记录
    ///
    /// # 返回
    /// 实际写入的题目数
    pub fn write(&self, document: &str, records: &[FinalAnswerRecord]) -> Result<usize> {
        let flagged: Vec<&FinalAnswerRecord> = records.iter().filter(|r| r.needs_manual_review()).collect();
        if flagged.is_empty() {
            return Ok(0);
        }
        debug!("写入复核: 文档 {} | {} 道题", document, flagged.len());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.review_file_path)?;

        for record in &flagged {
            let line = format!(
                "文档 {} | 题目 {} | 置信度 {:.2} | 溯源: {}\n",
                document,
                record.question_number,
                record.confidence,
                record.provenance()
            );
            file.write_all(line.as_bytes())?;
        }

        Ok(flagged.len())
    }
}

impl Default for ReviewWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::output::MANUAL_REVIEW;

    fn record(q: u32, chain: &[&str]) -> FinalAnswerRecord {
        FinalAnswerRecord {
            question_number: q,
            value: None,
            confidence: 0.4,
            validation_passed: false,
            provenance_chain: chain.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn appends_only_flagged_questions() {
        let path = std::env::temp_dir().join(format!("sheet_extract_review_{}.txt", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let writer = ReviewWriter::with_path(path.to_string_lossy().to_string());

        let records = vec![
            record(1, &["template_aware", "cheap_tier"]),
            record(5, &["template_aware", "cheap_tier", MANUAL_REVIEW]),
        ];
        assert_eq!(writer.write("sheet_a", &records).unwrap(), 1);
        assert_eq!(writer.write("sheet_b", &records).unwrap(), 1);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("文档 sheet_a | 题目 5"));
        assert!(content.contains("manual_review"));
        let _ = std::fs::remove_file(&path);
    }
}
