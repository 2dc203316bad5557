//! External collaborator adapters.

pub mod rig_adapter;

pub use rig_adapter::{
    AllowAllClassifier, LlmSafetyClassifier, OllamaReplyGenerator, ReplyFuture, ReplyGenerator,
    ReplyRequest, SafetyClassifier, SafetyVerdict, init_tracing,
};
