//! Gemini `generateContent` client for the Gemini API and Vertex AI.

pub(crate) mod client;
mod reply;
pub(crate) mod types;

pub use client::{GeminiClient, GeminiError, ModelClient, ModelRequest};
pub use types::ModelReply;
