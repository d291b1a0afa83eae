pub mod chat;
pub mod classify;
pub mod extract;

pub use chat::{ChatCompletionModel, TextModel};
pub use classify::{ClassificationEngine, ClassificationResult};
