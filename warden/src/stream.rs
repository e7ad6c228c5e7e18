//! Classifier for the worker's structured output stream.
//!
//! The worker prints newline-delimited JSON events (`assistant`, `user`,
//! `system`, `result`) interleaved with plain text from wrapper scripts.
//! [`StreamWriter`] accepts arbitrarily chunked bytes, reassembles complete
//! lines, and either narrates them for a human ([`StreamMode::Narrate`]) or
//! forwards only well-formed JSON objects ([`StreamMode::Machine`]).
//!
//! In both modes, `tool_result` blocks flagged as errors are reported to an
//! optional callback, which is how the off-rails detector learns about error
//! loops.

use std::io::{self, Write};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Partial lines longer than this are streamed raw (narrate) or dropped
/// (machine) instead of being buffered further.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Rendering mode for [`StreamWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Human-readable narration: text blocks, tool invocations, tool output.
    Narrate,
    /// Only lines that parse as JSON objects, re-emitted verbatim.
    Machine,
}

type ToolErrorCallback = Box<dyn FnMut(&str) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Buffering,
    /// Inside an oversize line; `keep` decides whether its bytes are forwarded.
    Oversize { keep: bool },
}

/// Line-reassembling writer that classifies worker output.
pub struct StreamWriter<W> {
    out: W,
    mode: StreamMode,
    buf: Vec<u8>,
    // Bytes of `buf` already known to contain no newline.
    scan: usize,
    state: LineState,
    on_tool_error: Option<ToolErrorCallback>,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(out: W, mode: StreamMode) -> Self {
        Self {
            out,
            mode,
            buf: Vec::new(),
            scan: 0,
            state: LineState::Buffering,
            on_tool_error: None,
        }
    }

    /// Register a callback receiving the content of every errored tool result.
    pub fn with_tool_error_callback(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_tool_error = Some(Box::new(callback));
        self
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// End of stream: process any residual bytes as a final line, then flush.
    pub fn finish(&mut self) -> io::Result<()> {
        if let LineState::Oversize { keep } = self.state {
            self.state = LineState::Buffering;
            if keep {
                self.out.write_all(b"\n")?;
            }
        } else if !self.buf.is_empty() {
            let mut line = std::mem::take(&mut self.buf);
            self.scan = 0;
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            self.handle_line(&line)?;
        }
        self.out.flush()
    }

    fn drain(&mut self) -> io::Result<()> {
        while let Some(pos) = self.buf[self.scan..].iter().position(|&b| b == b'\n') {
            let end = self.scan + pos;
            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.scan = 0;
            self.handle_line(&line)?;
        }
        self.scan = self.buf.len();

        if self.buf.len() > MAX_LINE_BYTES {
            let keep = self.mode == StreamMode::Narrate;
            warn!(
                bytes = self.buf.len(),
                keep, "stream line exceeds limit, skipping formatting"
            );
            if keep {
                self.out.write_all(&self.buf)?;
            }
            self.buf.clear();
            self.scan = 0;
            self.state = LineState::Oversize { keep };
        }
        Ok(())
    }

    fn write_oversize(&mut self, data: &[u8], keep: bool) -> io::Result<()> {
        let Some(pos) = data.iter().position(|&b| b == b'\n') else {
            if keep {
                self.out.write_all(data)?;
            }
            return Ok(());
        };
        if keep {
            self.out.write_all(&data[..=pos])?;
        }
        self.state = LineState::Buffering;
        let rest = &data[pos + 1..];
        if !rest.is_empty() {
            self.buf.extend_from_slice(rest);
            self.drain()?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &[u8]) -> io::Result<()> {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return Ok(());
        }
        if trimmed[0] != b'{' {
            return match self.mode {
                StreamMode::Narrate => self.emit_raw(line),
                StreamMode::Machine => Ok(()),
            };
        }
        match self.mode {
            StreamMode::Machine => self.handle_machine_line(trimmed),
            StreamMode::Narrate => self.handle_narrated_line(line, trimmed),
        }
    }

    fn handle_machine_line(&mut self, trimmed: &[u8]) -> io::Result<()> {
        if serde_json::from_slice::<Value>(trimmed).is_err() {
            debug!("dropping malformed json line");
            return Ok(());
        }
        if let Ok(event) = serde_json::from_slice::<StreamEvent>(trimmed) {
            self.report_tool_errors(&event);
        }
        self.out.write_all(trimmed)?;
        self.out.write_all(b"\n")
    }

    fn handle_narrated_line(&mut self, line: &[u8], trimmed: &[u8]) -> io::Result<()> {
        let event = match serde_json::from_slice::<StreamEvent>(trimmed) {
            Ok(event) => event,
            Err(err) => {
                debug!(err = %err, "undecodable json-shaped line, passing through");
                return self.emit_raw(line);
            }
        };
        self.report_tool_errors(&event);

        let rendered = event.render();
        if rendered.is_empty() {
            if event.is_suppressed() {
                return Ok(());
            }
            return self.emit_raw(line);
        }
        for text in rendered {
            self.out.write_all(text.as_bytes())?;
            if !text.ends_with('\n') {
                self.out.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    fn emit_raw(&mut self, line: &[u8]) -> io::Result<()> {
        self.out.write_all(line)?;
        self.out.write_all(b"\n")
    }

    fn report_tool_errors(&mut self, event: &StreamEvent) {
        let Some(callback) = self.on_tool_error.as_mut() else {
            return;
        };
        for content in event.tool_errors() {
            callback(&content);
        }
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if let LineState::Oversize { keep } = self.state {
            self.write_oversize(data, keep)?;
            return Ok(data.len());
        }
        self.buf.extend_from_slice(data);
        self.drain()?;
        Ok(data.len())
    }

    /// Flushes the destination only; buffered partial lines stay buffered
    /// until more bytes or [`StreamWriter::finish`] arrive.
    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// One decoded line of the worker's event protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Assistant {
        message: Option<StreamMessage>,
    },
    User {
        message: Option<StreamMessage>,
        /// Captured stdout/stderr of the most recent tool invocation.
        tool_use_result: Option<Value>,
    },
    System {
        message: Option<StreamMessage>,
    },
    Result {
        message: Option<StreamMessage>,
    },
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
        #[serde(default, alias = "isError")]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

impl StreamEvent {
    /// Narration lines for this event; empty when nothing is renderable.
    pub fn render(&self) -> Vec<String> {
        match self {
            Self::Assistant { message } => message.as_ref().map(render_assistant).unwrap_or_default(),
            Self::User {
                message,
                tool_use_result,
            } => render_user(message.as_ref(), tool_use_result.as_ref()),
            Self::System { .. } | Self::Result { .. } | Self::Unrecognized => Vec::new(),
        }
    }

    /// `system`/`result` events are dropped from narration unless they still
    /// carry renderable content.
    fn is_suppressed(&self) -> bool {
        match self {
            Self::System { message } | Self::Result { message } => {
                !message.as_ref().is_some_and(StreamMessage::has_renderable_content)
            }
            _ => false,
        }
    }

    /// Contents of every errored `tool_result` block in a `user` event.
    pub fn tool_errors(&self) -> Vec<String> {
        let Self::User {
            message: Some(message),
            ..
        } = self
        else {
            return Vec::new();
        };
        message
            .blocks()
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult {
                    content,
                    is_error: Some(true),
                } => Some(tool_result_text(content)),
                _ => None,
            })
            .collect()
    }
}

impl StreamMessage {
    fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }

    fn has_renderable_content(&self) -> bool {
        match &self.content {
            MessageContent::Text(text) => !text.trim().is_empty(),
            MessageContent::Blocks(blocks) => blocks.iter().any(|block| match block {
                ContentBlock::Text { text } => !text.trim().is_empty(),
                ContentBlock::ToolUse { .. } => true,
                ContentBlock::ToolResult { content, .. } => {
                    !tool_result_text(content).trim().is_empty()
                }
                ContentBlock::Other => false,
            }),
        }
    }
}

fn render_assistant(message: &StreamMessage) -> Vec<String> {
    match &message.content {
        MessageContent::Text(text) if !text.trim().is_empty() => vec![text.clone()],
        MessageContent::Text(_) => Vec::new(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => Some(text.clone()),
                ContentBlock::ToolUse { name, input } => Some(format_tool_use(name, input)),
                _ => None,
            })
            .collect(),
    }
}

fn render_user(message: Option<&StreamMessage>, tool_use_result: Option<&Value>) -> Vec<String> {
    if let Some(result) = tool_use_result {
        let captured: Vec<String> = ["stdout", "stderr"]
            .iter()
            .filter_map(|key| result.get(key).and_then(Value::as_str))
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
            .collect();
        if !captured.is_empty() {
            return captured;
        }
    }

    let Some(message) = message else {
        return Vec::new();
    };
    message
        .blocks()
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult { content, .. } => Some(tool_result_text(content)),
            _ => None,
        })
        .filter(|text| !text.trim().is_empty())
        .collect()
}

/// `[tool <name>] <command-or-description>`, or `[tool <name>]`.
fn format_tool_use(name: &str, input: &Value) -> String {
    let name = match name.trim() {
        "" => "tool",
        trimmed => trimmed,
    };
    let detail = ["command", "description"]
        .iter()
        .filter_map(|key| input.get(key).and_then(Value::as_str))
        .find(|text| !text.trim().is_empty());
    match detail {
        Some(detail) => format!("[tool {name}] {detail}"),
        None => format!("[tool {name}]"),
    }
}

/// Tool results carry either a plain string or a list of `{type:"text"}` parts.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn narrate(input: &str) -> String {
        run(StreamMode::Narrate, &[input.as_bytes()])
    }

    fn run(mode: StreamMode, chunks: &[&[u8]]) -> String {
        let mut writer = StreamWriter::new(Vec::new(), mode);
        for chunk in chunks {
            writer.write_all(chunk).expect("write");
        }
        writer.finish().expect("finish");
        String::from_utf8(writer.into_inner()).expect("utf8")
    }

    fn capture_errors(mode: StreamMode, input: &str) -> Vec<String> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut writer = StreamWriter::new(Vec::new(), mode).with_tool_error_callback(move |text| {
            sink.lock().expect("lock").push(text.to_string());
        });
        writer.write_all(input.as_bytes()).expect("write");
        writer.finish().expect("finish");
        let out = seen.lock().expect("lock").clone();
        out
    }

    #[test]
    fn narrates_assistant_text() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hello"}]}}"#;
        assert_eq!(narrate(&format!("{line}\n")), "hello\n");
    }

    #[test]
    fn narrates_tool_use_with_command() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","name":"Bash","input":{"command":"echo hi"}}]}}"#;
        assert_eq!(narrate(&format!("{line}\n")), "[tool Bash] echo hi\n");
    }

    #[test]
    fn narrates_tool_use_fallbacks() {
        let described = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Task","input":{"description":"explore repo"}}]}}"#;
        assert_eq!(narrate(&format!("{described}\n")), "[tool Task] explore repo\n");

        let bare = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"a.rs"}}]}}"#;
        assert_eq!(narrate(&format!("{bare}\n")), "[tool Read]\n");

        let unnamed = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"  "}]}}"#;
        assert_eq!(narrate(&format!("{unnamed}\n")), "[tool tool]\n");
    }

    #[test]
    fn user_prefers_captured_tool_output() {
        let line = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","content":"hi","tool_use_id":"toolu_123","is_error":false}]},"tool_use_result":{"stdout":"hi\n","stderr":""}}"#;
        assert_eq!(narrate(&format!("{line}\n")), "hi\n");
    }

    #[test]
    fn user_falls_back_to_tool_result_blocks() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"file written"},{"type":"tool_result","content":"  "}]},"tool_use_result":{"stdout":" ","stderr":""}}"#;
        assert_eq!(narrate(&format!("{line}\n")), "file written\n");

        let parts = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}]}}"#;
        assert_eq!(narrate(&format!("{parts}\n")), "a\nb\n");
    }

    #[test]
    fn suppresses_system_and_result_events() {
        let input = concat!(
            r#"{"type":"system","subtype":"init","cwd":"/tmp"}"#,
            "\n",
            r#"{"type":"result","subtype":"success","result":"done"}"#,
            "\n"
        );
        assert_eq!(narrate(input), "");
    }

    #[test]
    fn system_event_with_content_passes_through_raw() {
        let line = r#"{"type":"system","message":{"content":[{"type":"text","text":"compacting"}]}}"#;
        assert_eq!(narrate(&format!("{line}\n")), format!("{line}\n"));
    }

    #[test]
    fn unmapped_json_events_pass_through_raw() {
        let unknown = r#"{"type":"stream_event","event":{"delta":"x"}}"#;
        assert_eq!(narrate(&format!("{unknown}\n")), format!("{unknown}\n"));

        let empty_assistant = r#"{"type":"assistant","message":{"content":[]}}"#;
        assert_eq!(
            narrate(&format!("{empty_assistant}\n")),
            format!("{empty_assistant}\n")
        );

        let untyped = r#"{"hello":"world"}"#;
        assert_eq!(narrate(&format!("{untyped}\n")), format!("{untyped}\n"));
    }

    #[test]
    fn malformed_json_passes_through_raw() {
        assert_eq!(narrate("{not json\n"), "{not json\n");
    }

    #[test]
    fn plain_text_passes_through_verbatim() {
        assert_eq!(
            narrate("[ralph] iteration 1\r\n  indented line\n"),
            "[ralph] iteration 1\n  indented line\n"
        );
    }

    #[test]
    fn blank_lines_are_discarded() {
        assert_eq!(narrate("\n   \n\t\nafter\n"), "after\n");
    }

    #[test]
    fn machine_mode_emits_only_json_objects() {
        let event = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hello"}]}}"#;
        let input = format!("[ralph] iteration 1\n{event}\n{{broken\n  {{\"foo\":1}}  \n");
        let out = run(StreamMode::Machine, &[input.as_bytes()]);
        assert_eq!(out, format!("{event}\n{{\"foo\":1}}\n"));
    }

    #[test]
    fn split_writes_match_single_write() {
        let input = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"},{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#,
            "\r\nplain text\n",
            r#"{"type":"system","subtype":"init"}"#,
            "\ntrailing"
        )
        .as_bytes();

        for mode in [StreamMode::Narrate, StreamMode::Machine] {
            let whole = run(mode, &[input]);
            for size in [1, 2, 3, 7, 64] {
                let chunks: Vec<&[u8]> = input.chunks(size).collect();
                assert_eq!(run(mode, &chunks), whole, "mode={mode:?} size={size}");
            }
        }
    }

    #[test]
    fn finish_processes_residual_line() {
        let mut writer = StreamWriter::new(Vec::new(), StreamMode::Narrate);
        writer.write_all(b"no newline").expect("write");
        assert!(writer.get_ref().is_empty());
        writer.finish().expect("finish");
        assert_eq!(writer.into_inner(), b"no newline\n".to_vec());
    }

    #[test]
    fn reports_errored_tool_results_in_both_modes() {
        let line = concat!(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"cargo: command not found","is_error":true},{"type":"tool_result","content":"ok","is_error":false}]}}"#,
            "\n"
        );
        for mode in [StreamMode::Narrate, StreamMode::Machine] {
            assert_eq!(
                capture_errors(mode, line),
                vec!["cargo: command not found".to_string()]
            );
        }
    }

    #[test]
    fn accepts_camel_case_error_flag() {
        let line = concat!(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"boom","isError":true}]}}"#,
            "\n"
        );
        assert_eq!(
            capture_errors(StreamMode::Narrate, line),
            vec!["boom".to_string()]
        );
    }

    #[test]
    fn oversize_line_streams_raw_then_resumes() {
        let big = "x".repeat(MAX_LINE_BYTES + 10);
        let input = format!("{big}\nafter\n");
        let out = run(StreamMode::Narrate, &[input.as_bytes()]);
        assert_eq!(out, input);
    }

    #[test]
    fn oversize_line_is_dropped_in_machine_mode() {
        let big = format!("{{\"blob\":\"{}\"}}", "x".repeat(MAX_LINE_BYTES));
        let input = format!("{big}\n{{\"after\":true}}\n");
        let chunks: Vec<&[u8]> = input.as_bytes().chunks(4096).collect();
        let out = run(StreamMode::Machine, &chunks);
        assert_eq!(out, "{\"after\":true}\n");
    }
}
