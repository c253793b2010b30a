use futures_util::{Stream, StreamExt, pin_mut};

use crate::openai::{ChatCompletion, UPSTREAM_ERROR_SENTINEL, new_completion_id};

use super::stream::Frame;

/// Fold a translated stream into one `chat.completion`.
///
/// The stream is buffered to the end. An error fragment replaces whatever
/// text was collected so far and stops reading.
pub async fn aggregate<S>(frames: S, model: &str) -> ChatCompletion
where
    S: Stream<Item = Frame>,
{
    pin_mut!(frames);
    let mut id: Option<String> = None;
    let mut content = String::new();

    while let Some(frame) = frames.next().await {
        let Frame::Chunk(chunk) = frame else {
            continue;
        };
        if id.is_none() {
            id = Some(chunk.id.clone());
        }
        let Some(text) = chunk.delta().and_then(|d| d.content.as_deref()) else {
            continue;
        };
        if chunk.finish_reason() == Some("error") || text.contains(UPSTREAM_ERROR_SENTINEL) {
            content = text.to_string();
            break;
        }
        content.push_str(text);
    }

    ChatCompletion::assistant(id.unwrap_or_else(new_completion_id), model, content)
}
