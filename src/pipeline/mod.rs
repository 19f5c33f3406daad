mod backend;
mod batch;
mod config;
mod executor;
mod prompts;
mod trace;
mod translator;

pub use backend::{
    BackendError, BackendErrorKind, ChatMessage, ChatRequest, HttpBackend, TranslationBackend,
};
pub use batch::{schedule, Batch, BatchEntry, Schedule, TranslationTask};
pub use config::{init_default_config, PipelineConfig, ProfileKey, RequestProfile, RunMode};
pub use executor::{
    dispatch_batch, execute, BatchCache, BatchOutcome, ExecutionStats, ExecutorSettings,
    ResultTable, TaskOutcome,
};
pub use prompts::PromptCatalog;
pub use trace::BackupWriter;
pub use translator::{
    summary_line, TaskPosition, TranslationSummary, TranslatorPipeline, UpdateOptions,
};
