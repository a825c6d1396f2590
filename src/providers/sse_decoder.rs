//! Incremental `text/event-stream` decoding.
//!
//! Bytes may split anywhere, including inside a UTF-8 sequence, so lines
//! are only decoded once their terminating newline has arrived.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent
{   pub(crate) event: Option<String>
  , pub(crate) data: String
}

#[derive(Debug, Default)]
pub(crate) struct SseDecoder
{   buffer: Vec<u8>
  , event: Option<String>
  , data: Vec<String>
}

impl SseDecoder
{   pub(crate) fn new() -> Self
    {   SseDecoder::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent>
    {   self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n')
        {   let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r')
            {   line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.feed_line(&line)
            {   events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub(crate) fn finish(&mut self) -> Option<SseEvent>
    {   if !self.buffer.is_empty()
        {   let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(event) = self.feed_line(line.trim_end_matches('\r'))
            {   return Some(event);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent>
    {   if line.is_empty()
        {   return self.dispatch();
        }
        if line.starts_with(':')
        {   return None;
        }
        let (field, value) = match line.split_once(':')
        {   Some((field, value)) => {
              (field, value.strip_prefix(' ').unwrap_or(value))
            }
          , None => (line, "")
        };
        match field
        {   "event" => self.event = Some(value.to_string())
          , "data" => self.data.push(value.to_string())
          , _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent>
    {   let event = self.event.take();
        if self.data.is_empty()
        {   return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}
