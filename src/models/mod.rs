pub mod answer;
pub mod geometry;
pub mod loaders;
pub mod mark;
pub mod output;
pub mod recovery;
pub mod registry;
pub mod routing;
pub mod template;
pub mod validation;

pub use answer::{AttributedMark, BubbleQuality, ExtractedAnswer, ExtractionMethod, QuestionType};
pub use geometry::Rect;
pub use loaders::{load_all_template_files, load_registry, load_template_file};
pub use mark::{ClassifiedMark, FilterDecision, HandwritingVerdict, Mark, MarkType, StrokeFeatures};
pub use output::{FinalAnswerRecord, PipelineDiagnostics, PipelineOutput, ProcessingSummary};
pub use recovery::{RecoveryAttempt, RecoveryOutcome, RecoveryParameters, RecoveryStrategy};
pub use registry::TemplateRegistry;
pub use routing::{ComplexityScore, FallbackEvent, FallbackReason, ProcessingTier, RoutingPlan, TierBatch};
pub use template::{
    DocumentFormat, GridGeometry, QuestionSpec, SheetLayout, TemplateDefinition, TemplateElement, TemplateMatch, TextField,
};
pub use validation::{FindingKind, Severity, ValidationFinding, ValidationReport};
