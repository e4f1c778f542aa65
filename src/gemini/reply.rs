use tracing::warn;

use super::types::{GenerateContentResponse, ModelReply};

pub fn extract_reply(response: &GenerateContentResponse) -> ModelReply {
    let candidate = response.candidates.as_ref().and_then(|c| c.first());

    let text = candidate
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .map(|part| part.text.as_str())
                .collect::<String>()
        })
        .filter(|text| !text.trim().is_empty());

    if text.is_none() {
        let reason = candidate
            .and_then(|c| c.finish_reason.as_deref())
            .unwrap_or("none");
        warn!(finish_reason = reason, "Gemini returned empty answer");
    }

    let grounding_titles = candidate
        .and_then(|c| c.grounding_metadata.as_ref())
        .and_then(|m| m.grounding_chunks.as_ref())
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| chunk.web.as_ref()?.title.clone())
                .filter(|title| !title.is_empty())
                .collect()
        })
        .unwrap_or_default();

    ModelReply {
        text,
        grounding_titles,
    }
}
