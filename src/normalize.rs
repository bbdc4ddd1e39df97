use crate::constants::MAX_HISTORY_TURNS;
use crate::specs::anthropic::{CacheControl, ContentBlock, OutboundContent, OutboundMessage};
use crate::types::{ColloquyError, Result, Role, Turn};

/// Projects UI-held history onto the upstream message list.
///
/// Turns still streaming or with empty content are in-flight placeholders and
/// are dropped. Structured content flattens to one string. The last kept turn,
/// when it is a user turn, is wrapped as a single cache-marked block so the
/// provider can anchor its prompt cache at the end of the history; everything
/// else goes out as flat text. Order is preserved exactly.
pub fn normalize_history(turns: &[Turn]) -> Vec<OutboundMessage> {
    let kept: Vec<&Turn> = turns
        .iter()
        .filter(|t| !t.streaming && !t.is_empty())
        .collect();
    let last = kept.len().saturating_sub(1);

    kept.iter()
        .enumerate()
        .map(|(i, turn)| {
            let text = turn.flattened_text().into_owned();
            let content = if i == last && turn.role == Role::User {
                OutboundContent::Blocks(vec![ContentBlock::Text {
                    text,
                    cache_control: Some(CacheControl::ephemeral()),
                }])
            } else {
                OutboundContent::Text(text)
            };
            OutboundMessage {
                role: turn.role,
                content,
            }
        })
        .collect()
}

/// Rejects oversized histories before anything is sent upstream.
pub fn validate_history(turns: &[Turn]) -> Result<()> {
    if turns.len() > MAX_HISTORY_TURNS {
        return Err(ColloquyError::InvalidIngress(format!(
            "History too long: {} turns (max {})",
            turns.len(),
            MAX_HISTORY_TURNS
        ))
        .into());
    }
    Ok(())
}
