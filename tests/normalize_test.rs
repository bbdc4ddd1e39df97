use colloquy::normalize::{normalize_history, validate_history};
use colloquy::specs::anthropic::OutboundContent;
use colloquy::types::*;

fn streaming_placeholder(text: &str) -> Turn {
    let mut turn = Turn::assistant(text);
    turn.streaming = true;
    turn
}

#[test]
fn test_streaming_and_empty_turns_are_dropped() {
    let history = vec![
        Turn::user("hi"),
        Turn::assistant("hello"),
        Turn::user(""),
        streaming_placeholder("partial text does not save it"),
    ];

    let messages = normalize_history(&history);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
}

#[test]
fn test_block_content_flattens_to_one_string() {
    let mut turn = Turn::assistant("");
    turn.content = TurnContent::Blocks(vec![
        TextBlock {
            text: "first".to_string(),
        },
        TextBlock {
            text: " second".to_string(),
        },
    ]);
    let history = vec![Turn::user("q"), turn];

    let messages = normalize_history(&history);
    match &messages[1].content {
        OutboundContent::Text(text) => assert_eq!(text, "first second"),
        other => panic!("Expected flattened text, got {:?}", other),
    }
}

#[test]
fn test_cache_marker_lands_on_last_user_turn_only() {
    let history = vec![
        Turn::user("one"),
        Turn::assistant("two"),
        Turn::user("three"),
    ];

    let messages = normalize_history(&history);
    let json = serde_json::to_value(&messages).unwrap();

    // Earlier turns stay plain strings
    assert_eq!(json[0]["content"], "one");
    assert_eq!(json[1]["content"], "two");

    // The final user turn becomes a single cache-marked block
    assert_eq!(json[2]["content"][0]["type"], "text");
    assert_eq!(json[2]["content"][0]["text"], "three");
    assert_eq!(json[2]["content"][0]["cache_control"]["type"], "ephemeral");
}

#[test]
fn test_no_cache_marker_when_last_turn_is_assistant() {
    let history = vec![Turn::user("start"), Turn::assistant("prefill")];

    let messages = normalize_history(&history);
    let json = serde_json::to_value(&messages).unwrap();
    assert_eq!(json[1]["content"], "prefill");
    assert!(!json.to_string().contains("cache_control"));
}

#[test]
fn test_marker_moves_when_placeholder_hides_last_user() {
    // The trailing placeholder is dropped, so the marker belongs to the
    // user turn right before it.
    let history = vec![
        Turn::user("old"),
        Turn::assistant("reply"),
        Turn::user("new"),
        streaming_placeholder(""),
    ];

    let messages = normalize_history(&history);
    assert_eq!(messages.len(), 3);
    let json = serde_json::to_value(&messages).unwrap();
    assert_eq!(json[2]["content"][0]["text"], "new");
    assert_eq!(json[2]["content"][0]["cache_control"]["type"], "ephemeral");
}

#[test]
fn test_order_is_preserved() {
    let history = vec![
        Turn::user("a"),
        Turn::assistant("b"),
        Turn::user("c"),
        Turn::assistant("d"),
    ];

    let messages = normalize_history(&history);
    let texts: Vec<String> = messages
        .iter()
        .map(|m| match &m.content {
            OutboundContent::Text(text) => text.clone(),
            OutboundContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    colloquy::specs::anthropic::ContentBlock::Text { text, .. } => text.clone(),
                })
                .collect(),
        })
        .collect();
    assert_eq!(texts, vec!["a", "b", "c", "d"]);
}

#[test]
fn test_validate_history_enforces_turn_cap() {
    let ok: Vec<Turn> = (0..1000).map(|i| Turn::user(format!("t{}", i))).collect();
    assert!(validate_history(&ok).is_ok());

    let too_many: Vec<Turn> = (0..1001).map(|i| Turn::user(format!("t{}", i))).collect();
    let err = match validate_history(&too_many) {
        Err(e) => e.to_string(),
        Ok(_) => panic!("Expected the 1001-turn history to be rejected"),
    };
    assert!(err.contains("History too long"));
}
