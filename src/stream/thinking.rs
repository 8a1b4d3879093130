// Splits `<thinking>…</thinking>` spans out of streaming assistant text.
// Tags can arrive split across chunk boundaries, so a potential tag is
// buffered until it either matches or stops being a prefix.

const OPEN_TAGS: [&str; 2] = ["<thinking>", "<think>"];

#[derive(Debug, Clone, PartialEq)]
pub enum SplitEvent {
    Text(String),
    ThinkingStart,
    ThinkingDelta(String),
    ThinkingEnd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SplitState {
    Normal,
    PotentialOpen,
    InThinking,
    PotentialClose,
}

#[derive(Debug)]
pub struct ThinkingSplitter {
    state: SplitState,
    tag_buffer: String,
    /// Index of the matched open tag; its close tag must match to exit.
    active_tag: Option<usize>,
}

impl ThinkingSplitter {
    pub fn new() -> Self {
        Self {
            state: SplitState::Normal,
            tag_buffer: String::new(),
            active_tag: None,
        }
    }

    fn close_tag(index: usize) -> String {
        OPEN_TAGS[index].replace('<', "</")
    }

    fn matches_open(&self) -> Option<usize> {
        OPEN_TAGS.iter().position(|tag| *tag == self.tag_buffer)
    }

    fn is_open_prefix(&self) -> bool {
        OPEN_TAGS
            .iter()
            .any(|tag| tag.starts_with(&self.tag_buffer) && *tag != self.tag_buffer)
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SplitEvent> {
        let mut events = Vec::new();
        let mut accum = String::new();

        for ch in chunk.chars() {
            match self.state {
                SplitState::Normal => {
                    if ch == '<' {
                        Self::flush(&mut accum, &mut events, self.state);
                        self.tag_buffer.clear();
                        self.tag_buffer.push(ch);
                        self.state = SplitState::PotentialOpen;
                    } else {
                        accum.push(ch);
                    }
                }
                SplitState::PotentialOpen => {
                    self.tag_buffer.push(ch);
                    if let Some(index) = self.matches_open() {
                        Self::flush(&mut accum, &mut events, SplitState::Normal);
                        self.active_tag = Some(index);
                        self.tag_buffer.clear();
                        self.state = SplitState::InThinking;
                        events.push(SplitEvent::ThinkingStart);
                    } else if !self.is_open_prefix() {
                        accum.push_str(&self.tag_buffer);
                        self.tag_buffer.clear();
                        self.state = SplitState::Normal;
                    }
                }
                SplitState::InThinking => {
                    if ch == '<' {
                        Self::flush(&mut accum, &mut events, self.state);
                        self.tag_buffer.clear();
                        self.tag_buffer.push(ch);
                        self.state = SplitState::PotentialClose;
                    } else {
                        accum.push(ch);
                    }
                }
                SplitState::PotentialClose => {
                    self.tag_buffer.push(ch);
                    let close = Self::close_tag(self.active_tag.unwrap_or(0));
                    if self.tag_buffer == close {
                        Self::flush(&mut accum, &mut events, SplitState::InThinking);
                        self.tag_buffer.clear();
                        self.active_tag = None;
                        self.state = SplitState::Normal;
                        events.push(SplitEvent::ThinkingEnd);
                    } else if !close.starts_with(self.tag_buffer.as_str()) {
                        accum.push_str(&self.tag_buffer);
                        self.tag_buffer.clear();
                        self.state = SplitState::InThinking;
                    }
                }
            }
        }

        Self::flush(&mut accum, &mut events, self.state);
        events
    }

    /// Drain whatever is left at stream end. An unterminated thinking span
    /// is closed; an incomplete tag is emitted as literal text.
    pub fn finish(&mut self) -> Vec<SplitEvent> {
        let mut events = Vec::new();

        if !self.tag_buffer.is_empty() {
            let leftover = std::mem::take(&mut self.tag_buffer);
            match self.state {
                SplitState::PotentialOpen | SplitState::Normal => {
                    events.push(SplitEvent::Text(leftover));
                }
                SplitState::PotentialClose | SplitState::InThinking => {
                    events.push(SplitEvent::ThinkingDelta(leftover));
                }
            }
        }

        if matches!(self.state, SplitState::InThinking | SplitState::PotentialClose) {
            events.push(SplitEvent::ThinkingEnd);
        }

        self.state = SplitState::Normal;
        self.active_tag = None;
        events
    }

    fn flush(accum: &mut String, events: &mut Vec<SplitEvent>, state: SplitState) {
        if accum.is_empty() {
            return;
        }
        let text = std::mem::take(accum);
        match state {
            SplitState::InThinking | SplitState::PotentialClose => {
                events.push(SplitEvent::ThinkingDelta(text))
            }
            _ => events.push(SplitEvent::Text(text)),
        }
    }
}

impl Default for ThinkingSplitter {
    fn default() -> Self {
        Self::new()
    }
}
