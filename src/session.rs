use crate::types::{Conversation, RelayEvent, Role, TextBlock, Turn, TurnContent, Usage};

/// Where a conversation's current (or most recent) request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Sending,
    Streaming,
    Settled,
    Errored,
    Canceled,
}

impl TurnPhase {
    /// True while a request is outstanding for this conversation.
    pub fn is_busy(&self) -> bool {
        matches!(self, TurnPhase::Sending | TurnPhase::Streaming)
    }

    fn is_resting(&self) -> bool {
        !self.is_busy()
    }
}

/// How a request ended. `Settled` is the only outcome whose turn pair is
/// handed to store sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Settled,
    Errored,
}

/// Reducer over one conversation: relay events apply as pure state updates,
/// no I/O. The driver that feeds it owns the network; tests feed it directly.
///
/// Phase walk: `Idle -> Sending -> Streaming -> (Settled|Errored|Canceled)`,
/// where the first text fragment moves Sending to Streaming. Resting phases
/// ignore late events, so a buffered fragment that races a cancel is dropped
/// rather than resurrecting the turn.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub conversation: Conversation,
    pub phase: TurnPhase,
    pending_usage: Option<Usage>,
}

impl ChatSession {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            phase: TurnPhase::Idle,
            pending_usage: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.phase.is_busy()
    }

    /// Appends the user turn and an empty assistant placeholder with the
    /// streaming flag set. The caller enforces the one-outstanding-send
    /// contract before calling this.
    pub fn begin_send(&mut self, text: String) {
        self.conversation.turns.push(Turn::user(text));
        let mut placeholder = Turn::assistant("");
        placeholder.streaming = true;
        self.conversation.turns.push(placeholder);
        self.conversation.touch();
        self.pending_usage = None;
        self.phase = TurnPhase::Sending;
    }

    /// Applies one relay event. Returns the outcome when the event was
    /// terminal for this request, `None` otherwise.
    pub fn apply(&mut self, event: &RelayEvent) -> Option<TurnOutcome> {
        if self.phase.is_resting() {
            return None;
        }

        match event {
            RelayEvent::Text { text } => {
                if self.phase == TurnPhase::Sending {
                    self.phase = TurnPhase::Streaming;
                }
                self.push_text(text);
                None
            }
            RelayEvent::Usage { usage } | RelayEvent::UsageStart { usage } => {
                self.pending_usage
                    .get_or_insert_with(Usage::default)
                    .merge(usage);
                None
            }
            RelayEvent::Done => {
                let usage = self.pending_usage.take().filter(|u| !u.is_empty());
                if let Some(turn) = self.trailing_assistant_mut() {
                    turn.streaming = false;
                    turn.usage = usage;
                }
                self.conversation.touch();
                self.phase = TurnPhase::Settled;
                Some(TurnOutcome::Settled)
            }
            RelayEvent::Error { error } => {
                if let Some(turn) = self.trailing_assistant_mut() {
                    turn.content = TurnContent::Text(format!("Error: {}", error));
                    turn.streaming = false;
                }
                self.pending_usage = None;
                self.phase = TurnPhase::Errored;
                Some(TurnOutcome::Errored)
            }
        }
    }

    /// Stops the current request in place: the streaming flag clears, text
    /// received so far stays, no usage attaches, no error is recorded.
    /// Idempotent; a second cancel (or a cancel after settle) does nothing.
    pub fn cancel(&mut self) {
        if !self.phase.is_busy() {
            return;
        }
        if let Some(turn) = self.trailing_assistant_mut() {
            turn.streaming = false;
        }
        self.pending_usage = None;
        self.phase = TurnPhase::Canceled;
    }

    /// The finished user+assistant pair, available once settled.
    pub fn settled_pair(&self) -> Option<(&Turn, &Turn)> {
        if self.phase != TurnPhase::Settled {
            return None;
        }
        let n = self.conversation.turns.len();
        if n < 2 {
            return None;
        }
        Some((&self.conversation.turns[n - 2], &self.conversation.turns[n - 1]))
    }

    /// True when the settled pair is the conversation's first, which is when
    /// the title gets derived.
    pub fn is_first_pair(&self) -> bool {
        self.conversation.turns.len() == 2
    }

    fn push_text(&mut self, fragment: &str) {
        if let Some(turn) = self.trailing_assistant_mut() {
            match &mut turn.content {
                TurnContent::Text(text) => text.push_str(fragment),
                TurnContent::Blocks(blocks) => blocks.push(TextBlock {
                    text: fragment.to_string(),
                }),
            }
        }
    }

    fn trailing_assistant_mut(&mut self) -> Option<&mut Turn> {
        match self.conversation.turns.last_mut() {
            Some(turn) if turn.role == Role::Assistant => Some(turn),
            _ => None,
        }
    }
}
