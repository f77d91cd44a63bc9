//! Streaming and human-input callbacks
//!
//! A [`StreamingSink`] observes agent output as it is produced. Message
//! boundary state lives in the sink instance, so every session gets its own
//! sink. A [`HumanInput`] source supplies the next user message whenever an
//! agent finishes a turn without calling a function.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{ChatMessage, ContentItem, FunctionCall, FunctionResult};

/// A piece of agent output. Text arrives in many small chunks; function
/// calls and results arrive as one chunk each.
#[derive(Debug, Clone)]
pub struct StreamingChunk {
    pub author: String,
    pub items: Vec<ContentItem>,
}

impl StreamingChunk {
    pub fn text(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            items: vec![ContentItem::Text { text: text.into() }],
        }
    }

    /// Chunk with no content, used to close a streamed message
    pub fn end(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            items: Vec::new(),
        }
    }

    pub fn function_call(author: impl Into<String>, call: FunctionCall) -> Self {
        Self {
            author: author.into(),
            items: vec![ContentItem::FunctionCall(call)],
        }
    }

    pub fn function_result(author: impl Into<String>, result: FunctionResult) -> Self {
        Self {
            author: author.into(),
            items: vec![ContentItem::FunctionResult(result)],
        }
    }
}

/// Observer of streamed agent output. `is_final` marks the last chunk of a
/// logical message.
pub trait StreamingSink: Send {
    fn on_chunk(&mut self, chunk: &StreamingChunk, is_final: bool);
}

/// Builds one sink per session
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn StreamingSink> + Send + Sync>;

/// Prints agent output as `<Agent>: <content>`, one logical message per line
pub struct ConsoleStreamingSink<W: Write + Send> {
    out: W,
    new_message: bool,
}

impl ConsoleStreamingSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleStreamingSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            new_message: true,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_chunk(&mut self, chunk: &StreamingChunk, is_final: bool) -> std::io::Result<()> {
        if self.new_message && !chunk.items.is_empty() {
            write!(self.out, "{}: ", chunk.author)?;
            self.new_message = false;
        }

        for item in &chunk.items {
            match item {
                ContentItem::Text { text } => write!(self.out, "{}", text)?,
                ContentItem::FunctionCall(call) => write!(
                    self.out,
                    "Calling '{}' with arguments '{}'",
                    call.name, call.arguments
                )?,
                ContentItem::FunctionResult(result) => write!(
                    self.out,
                    "Result from '{}' is '{}'",
                    result.name,
                    result.result.as_deref().unwrap_or("None")
                )?,
            }
        }

        if is_final && !self.new_message {
            writeln!(self.out)?;
            self.new_message = true;
        }
        self.out.flush()
    }
}

impl<W: Write + Send> StreamingSink for ConsoleStreamingSink<W> {
    fn on_chunk(&mut self, chunk: &StreamingChunk, is_final: bool) {
        if let Err(e) = self.write_chunk(chunk, is_final) {
            warn!("Failed to write agent output: {}", e);
        }
    }
}

/// Rebuilds whole messages from streamed chunks
#[derive(Debug, Default)]
pub struct TranscriptSink {
    messages: Arc<Mutex<Vec<ChatMessage>>>,
    pending: Option<(String, String)>,
}

impl TranscriptSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the reconstructed messages, readable after the sink
    /// has been handed to a session
    pub fn transcript(&self) -> Arc<Mutex<Vec<ChatMessage>>> {
        self.messages.clone()
    }

    fn push(&self, message: ChatMessage) {
        match self.messages.lock() {
            Ok(mut messages) => messages.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }

    fn flush_pending(&mut self) {
        if let Some((author, text)) = self.pending.take() {
            self.push(ChatMessage::agent_text(author, text));
        }
    }
}

impl StreamingSink for TranscriptSink {
    fn on_chunk(&mut self, chunk: &StreamingChunk, is_final: bool) {
        for item in &chunk.items {
            match item {
                ContentItem::Text { text } => match &mut self.pending {
                    Some((author, pending)) if *author == chunk.author => pending.push_str(text),
                    _ => {
                        self.flush_pending();
                        self.pending = Some((chunk.author.clone(), text.clone()));
                    }
                },
                ContentItem::FunctionCall(call) => {
                    self.flush_pending();
                    self.push(ChatMessage::function_call(&chunk.author, call.clone()));
                }
                ContentItem::FunctionResult(result) => {
                    self.flush_pending();
                    self.push(ChatMessage::function_result(&chunk.author, result.clone()));
                }
            }
        }
        if is_final {
            self.flush_pending();
        }
    }
}

/// Source of the next human message. `Ok(None)` means input is closed.
#[async_trait]
pub trait HumanInput: Send + Sync {
    async fn next_message(&self) -> Result<Option<ChatMessage>>;
}

/// Prompts `User: ` on stdout and reads one line from stdin.
///
/// Lines are read on a dedicated OS thread and handed over through a
/// channel. The blocking read never runs on the runtime, so a session can
/// time out or shut down while the thread is still parked on input.
pub struct StdinHumanInput {
    lines: tokio::sync::Mutex<mpsc::Receiver<std::io::Result<String>>>,
    prompt: bool,
}

impl StdinHumanInput {
    pub fn new() -> Self {
        Self::spawn_reader(BufReader::new(std::io::stdin()), true)
    }

    /// Read lines from any source instead of stdin, without prompting
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        Self::spawn_reader(reader, false)
    }

    fn spawn_reader<R>(reader: R, prompt: bool) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        std::thread::spawn(move || {
            for line in reader.lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
            debug!("Human input reader finished");
        });
        Self {
            lines: tokio::sync::Mutex::new(rx),
            prompt,
        }
    }
}

impl Default for StdinHumanInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HumanInput for StdinHumanInput {
    async fn next_message(&self) -> Result<Option<ChatMessage>> {
        if self.prompt {
            let mut stdout = std::io::stdout();
            write!(stdout, "User: ")?;
            stdout.flush()?;
        }

        match self.lines.lock().await.recv().await {
            Some(line) => Ok(Some(ChatMessage::user(line?))),
            None => Ok(None),
        }
    }
}

/// Replays a fixed list of user lines, then reports closed input
#[derive(Debug, Default)]
pub struct ScriptedHumanInput {
    lines: Mutex<VecDeque<String>>,
}

impl ScriptedHumanInput {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Mutex::new(lines.into_iter().map(Into::into).collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[async_trait]
impl HumanInput for ScriptedHumanInput {
    async fn next_message(&self) -> Result<Option<ChatMessage>> {
        let next = self
            .lines
            .lock()
            .map_err(|_| anyhow::anyhow!("scripted input lock poisoned"))?
            .pop_front();
        Ok(next.map(ChatMessage::user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(chunks: &[(StreamingChunk, bool)]) -> String {
        let mut sink = ConsoleStreamingSink::new(Vec::new());
        for (chunk, is_final) in chunks {
            sink.on_chunk(chunk, *is_final);
        }
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn test_console_prefixes_each_message_once() {
        let out = render(&[
            (StreamingChunk::text("SupportAgent", "Hello, "), false),
            (StreamingChunk::text("SupportAgent", "how can I help?"), false),
            (StreamingChunk::end("SupportAgent"), true),
        ]);
        assert_eq!(out, "SupportAgent: Hello, how can I help?\n");
    }

    #[test]
    fn test_console_renders_calls_and_results() {
        let call = FunctionCall {
            id: "call_1".to_string(),
            name: "OrderStatusPlugin-check_order_status".to_string(),
            arguments: json!({"order_id": "123"}),
        };
        let result = FunctionResult {
            call_id: "call_1".to_string(),
            name: "Handoff-transfer_to_OrderStatusAgent".to_string(),
            result: None,
        };
        let out = render(&[
            (StreamingChunk::function_call("OrderStatusAgent", call), true),
            (StreamingChunk::function_result("SupportAgent", result), true),
        ]);
        assert_eq!(
            out,
            "OrderStatusAgent: Calling 'OrderStatusPlugin-check_order_status' with arguments '{\"order_id\":\"123\"}'\n\
             SupportAgent: Result from 'Handoff-transfer_to_OrderStatusAgent' is 'None'\n"
        );
    }

    #[test]
    fn test_console_end_without_content_prints_nothing() {
        assert_eq!(render(&[(StreamingChunk::end("SupportAgent"), true)]), "");
    }

    #[test]
    fn test_sinks_keep_independent_boundary_state() {
        let mut a = ConsoleStreamingSink::new(Vec::new());
        let mut b = ConsoleStreamingSink::new(Vec::new());
        a.on_chunk(&StreamingChunk::text("RefundAgent", "part"), false);
        b.on_chunk(&StreamingChunk::text("OrderReturnAgent", "done"), true);
        a.on_chunk(&StreamingChunk::text("RefundAgent", " two"), true);

        assert_eq!(String::from_utf8(a.into_inner()).unwrap(), "RefundAgent: part two\n");
        assert_eq!(String::from_utf8(b.into_inner()).unwrap(), "OrderReturnAgent: done\n");
    }

    #[test]
    fn test_transcript_rebuilds_messages() {
        let mut sink = TranscriptSink::new();
        let transcript = sink.transcript();

        sink.on_chunk(&StreamingChunk::text("SupportAgent", "Hi"), false);
        sink.on_chunk(&StreamingChunk::text("SupportAgent", " there"), false);
        sink.on_chunk(&StreamingChunk::end("SupportAgent"), true);
        sink.on_chunk(
            &StreamingChunk::function_call(
                "SupportAgent",
                FunctionCall {
                    id: "c".to_string(),
                    name: "Handoff-transfer_to_RefundAgent".to_string(),
                    arguments: json!({}),
                },
            ),
            true,
        );

        let messages = transcript.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "Hi there");
        assert_eq!(messages[0].author.as_deref(), Some("SupportAgent"));
        assert!(matches!(messages[1].items[0], ContentItem::FunctionCall(_)));
    }

    #[tokio::test]
    async fn test_scripted_input_replays_then_closes() {
        let input = ScriptedHumanInput::new(["I want to track my order", "123"]);
        assert_eq!(input.remaining(), 2);

        let first = input.next_message().await.unwrap().unwrap();
        assert_eq!(first.text(), "I want to track my order");
        assert_eq!(input.next_message().await.unwrap().unwrap().text(), "123");
        assert!(input.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_input_strips_newlines_then_closes() {
        let input = StdinHumanInput::from_reader(std::io::Cursor::new("Where is order 123?\r\nquit\n"));

        let first = input.next_message().await.unwrap().unwrap();
        assert_eq!(first.text(), "Where is order 123?");
        assert_eq!(input.next_message().await.unwrap().unwrap().text(), "quit");
        assert!(input.next_message().await.unwrap().is_none());
    }

    /// Blocks in `read` until the test ends
    struct ParkedReader(std::sync::mpsc::Receiver<()>);

    impl std::io::Read for ParkedReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_line_input_wait_can_be_abandoned() {
        let (_hold, parked) = std::sync::mpsc::channel::<()>();
        let input = StdinHumanInput::from_reader(BufReader::new(ParkedReader(parked)));

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), input.next_message()).await;
        assert!(waited.is_err());
    }
}
