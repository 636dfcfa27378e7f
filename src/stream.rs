//! Folds streamed worker output into one assistant message per turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { tool: Value },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub blocks: Vec<ContentBlock>,
}

impl AssistantMessage {
    /// All text blocks joined in order.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Which trailing block further deltas extend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Segment {
    #[default]
    None,
    Text,
    Thinking,
}

#[derive(Debug, Default)]
pub struct StreamAssembler {
    message: AssistantMessage,
    segment: Segment,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn on_text_delta(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if self.segment == Segment::Text {
            if let Some(ContentBlock::Text { text }) = self.message.blocks.last_mut() {
                text.push_str(delta);
                return;
            }
        }
        self.message.blocks.push(ContentBlock::Text {
            text: delta.to_string(),
        });
        self.segment = Segment::Text;
    }

    pub fn on_thinking_delta(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if self.segment == Segment::Thinking {
            if let Some(ContentBlock::Thinking { thinking }) = self.message.blocks.last_mut() {
                thinking.push_str(delta);
                return;
            }
        }
        self.message.blocks.push(ContentBlock::Thinking {
            thinking: delta.to_string(),
        });
        self.segment = Segment::Thinking;
    }

    /// Merge a full re-send of the accumulated text. The longer of the local
    /// text and the snapshot wins, so stale snapshots never shrink what was
    /// already rendered. A snapshot that extends the local text only adds
    /// its new tail, whatever segment is open.
    pub fn on_content_snapshot(&mut self, snapshot: &str) {
        self.merge_snapshot(Segment::Text, snapshot);
    }

    pub fn on_thinking_snapshot(&mut self, snapshot: &str) {
        self.merge_snapshot(Segment::Thinking, snapshot);
    }

    fn merge_snapshot(&mut self, kind: Segment, snapshot: &str) {
        let local = self.accumulated(kind);
        if snapshot.chars().count() <= local.chars().count() {
            return;
        }
        if let Some(tail) = snapshot.strip_prefix(local.as_str()) {
            match kind {
                Segment::Text => self.on_text_delta(tail),
                Segment::Thinking => self.on_thinking_delta(tail),
                Segment::None => {}
            }
            return;
        }

        // Diverged re-send: the snapshot takes the place of the first block
        // of its kind and the later ones are folded into it.
        let mut replaced = false;
        self.message
            .blocks
            .retain_mut(|block| match body_mut(block, kind) {
                None => true,
                Some(_) if replaced => false,
                Some(body) => {
                    *body = snapshot.to_string();
                    replaced = true;
                    true
                }
            });
        let open = self
            .message
            .blocks
            .last_mut()
            .is_some_and(|block| body_mut(block, kind).is_some());
        if open {
            self.segment = kind;
        } else if self.segment == kind {
            self.segment = Segment::None;
        }
    }

    fn accumulated(&self, kind: Segment) -> String {
        self.message
            .blocks
            .iter()
            .filter_map(|block| match (kind, block) {
                (Segment::Text, ContentBlock::Text { text }) => Some(text.as_str()),
                (Segment::Thinking, ContentBlock::Thinking { thinking }) => {
                    Some(thinking.as_str())
                }
                _ => None,
            })
            .collect()
    }

    /// A tool call always ends the current prose or thinking segment.
    pub fn on_tool_use(&mut self, tool: Value) {
        self.message.blocks.push(ContentBlock::ToolUse { tool });
        self.segment = Segment::None;
    }

    /// Seal the message and hand it over. The assembler starts empty again.
    pub fn on_stream_end(&mut self) -> AssistantMessage {
        self.segment = Segment::None;
        std::mem::take(&mut self.message)
    }

    pub fn snapshot(&self) -> AssistantMessage {
        self.message.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }
}

fn body_mut(block: &mut ContentBlock, kind: Segment) -> Option<&mut String> {
    match (kind, block) {
        (Segment::Text, ContentBlock::Text { text }) => Some(text),
        (Segment::Thinking, ContentBlock::Thinking { thinking }) => Some(thinking),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AssistantMessage, ContentBlock, Segment, StreamAssembler};

    fn text(s: &str) -> ContentBlock {
        ContentBlock::Text { text: s.into() }
    }

    fn thinking(s: &str) -> ContentBlock {
        ContentBlock::Thinking {
            thinking: s.into(),
        }
    }

    #[test]
    fn deltas_extend_one_block_and_stale_snapshot_is_ignored() {
        let mut assembler = StreamAssembler::new();
        for delta in ["Hel", "lo ", "world"] {
            assembler.on_text_delta(delta);
        }
        assembler.on_content_snapshot("Hello wor");
        assert_eq!(assembler.snapshot().blocks, vec![text("Hello world")]);
    }

    #[test]
    fn longer_snapshot_replaces_local_text() {
        let mut assembler = StreamAssembler::new();
        assembler.on_text_delta("Hello");
        assembler.on_content_snapshot("Hello there");
        assembler.on_content_snapshot("Hello there");
        assembler.on_text_delta("!");
        assert_eq!(assembler.snapshot().blocks, vec![text("Hello there!")]);
    }

    #[test]
    fn snapshot_length_counts_characters_not_bytes() {
        let mut assembler = StreamAssembler::new();
        assembler.on_text_delta("héllo");
        // Six bytes, five chars; equal length keeps the local text.
        assembler.on_content_snapshot("hello");
        assert_eq!(assembler.snapshot().blocks, vec![text("héllo")]);
    }

    #[test]
    fn tool_use_splits_thinking_segments() {
        let mut assembler = StreamAssembler::new();
        assembler.on_thinking_delta("a");
        assembler.on_tool_use(json!({"name": "X"}));
        assert_eq!(assembler.segment(), Segment::None);
        assembler.on_thinking_delta("b");
        assert_eq!(
            assembler.snapshot().blocks,
            vec![
                thinking("a"),
                ContentBlock::ToolUse {
                    tool: json!({"name": "X"})
                },
                thinking("b"),
            ]
        );
    }

    #[test]
    fn switching_kinds_opens_new_blocks() {
        let mut assembler = StreamAssembler::new();
        assembler.on_thinking_delta("plan");
        assembler.on_text_delta("answer");
        assert_eq!(assembler.segment(), Segment::Text);
        assembler.on_thinking_delta("more");
        assert_eq!(
            assembler.snapshot().blocks,
            vec![thinking("plan"), text("answer"), thinking("more")]
        );
    }

    #[test]
    fn snapshot_after_tool_use_only_adds_the_new_tail() {
        let mut assembler = StreamAssembler::new();
        assembler.on_text_delta("before");
        assembler.on_tool_use(json!({}));
        assembler.on_content_snapshot("before");
        assert_eq!(assembler.snapshot().blocks.len(), 2);

        assembler.on_content_snapshot("beforeafter");
        assert_eq!(
            assembler.snapshot().blocks,
            vec![
                text("before"),
                ContentBlock::ToolUse { tool: json!({}) },
                text("after"),
            ]
        );
        assert_eq!(assembler.segment(), Segment::Text);
    }

    #[test]
    fn stale_snapshot_after_segment_switch_keeps_rendered_text() {
        let mut assembler = StreamAssembler::new();
        for delta in ["Hel", "lo ", "world"] {
            assembler.on_text_delta(delta);
        }
        assembler.on_thinking_delta("x");
        assembler.on_content_snapshot("Hello wor");
        assembler.on_content_snapshot("Hello world");
        assert_eq!(
            assembler.snapshot().blocks,
            vec![text("Hello world"), thinking("x")]
        );
        assert_eq!(assembler.snapshot().text(), "Hello world");
        assert_eq!(assembler.segment(), Segment::Thinking);
    }

    #[test]
    fn diverged_longer_snapshot_replaces_text_blocks() {
        let mut assembler = StreamAssembler::new();
        assembler.on_text_delta("abc");
        assembler.on_tool_use(json!({"name": "Read"}));
        assembler.on_text_delta("def");
        assembler.on_content_snapshot("a fresh rewrite");
        assert_eq!(
            assembler.snapshot().blocks,
            vec![
                text("a fresh rewrite"),
                ContentBlock::ToolUse {
                    tool: json!({"name": "Read"})
                },
            ]
        );
        assert_eq!(assembler.segment(), Segment::None);
    }

    #[test]
    fn thinking_snapshot_merges_across_text() {
        let mut assembler = StreamAssembler::new();
        assembler.on_thinking_delta("let me");
        assembler.on_text_delta("Hi");
        assembler.on_thinking_snapshot("let");
        assembler.on_thinking_snapshot("let me");
        assert_eq!(
            assembler.snapshot().blocks,
            vec![thinking("let me"), text("Hi")]
        );
    }

    #[test]
    fn stream_end_seals_and_resets() {
        let mut assembler = StreamAssembler::new();
        assembler.on_text_delta("done");
        let message = assembler.on_stream_end();
        assert_eq!(message.blocks, vec![text("done")]);
        assert!(assembler.is_empty());
        assert_eq!(assembler.segment(), Segment::None);
        assert_eq!(assembler.on_stream_end(), AssistantMessage::default());
    }

    #[test]
    fn blocks_serialize_with_type_tags() {
        let encoded = serde_json::to_value(thinking("t")).unwrap();
        assert_eq!(encoded, json!({"type": "thinking", "thinking": "t"}));
    }
}
