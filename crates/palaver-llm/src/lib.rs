//! The unified AI-provider streaming client layer of the Palaver chat
//! platform.
//!
//! Everything provider-specific lives behind [`providers::ProviderAdapter`];
//! everything conversation-specific lives in [`session::GenerationSession`].
//! The two meet only through the normalized [`message`] model and its
//! [`message::StreamEvent`] vocabulary.

pub mod compactor;
pub mod events;
pub mod message;
pub mod providers;
pub mod registry;
pub mod session;
pub mod storage;
pub mod tokens;
pub mod tools;

pub use events::{SessionEvent, SessionWarning, ToolCallState};
pub use message::{
    ContentPart, FinishReason, GenerationRequest, Message, Role, SamplingParams, StreamEvent,
    ToolCallArguments, ToolSpec, Usage,
};
pub use providers::{EventStream, ProviderAdapter};
pub use registry::{ClientRegistry, ResolvedClient};
pub use session::{GenerationSession, SessionOptions, SessionOutcome, SessionStatus};
pub use storage::{ConversationStore, InMemoryStore};
pub use tokens::{ModelLimits, TokenAccountant, TokenBudget};
pub use tools::{ToolHandler, ToolInvoker, ToolRegistry};
