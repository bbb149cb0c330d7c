/*
    FluxMend
    https://github.com/dbalsom/fluxmend

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/messages.rs

    Warning and fixup reporting. Scanning a disk tends to produce the same
    notice on every cylinder, so messages are de-duplicated by text before
    reaching the log. The sink is thread-local: the thread driving a scan is
    the one reporting on it.
*/

use std::cell::RefCell;
use std::collections::HashSet;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Info,
    Warning,
    /// A known protection repair or structural correction was applied.
    Fix,
}

#[derive(Default)]
struct SinkState {
    seen: HashSet<String>,
    entries: Vec<(MessageKind, String)>,
}

thread_local! {
    static SINK: RefCell<SinkState> = RefCell::new(SinkState::default());
}

fn emit(kind: MessageKind, text: &str) {
    match kind {
        MessageKind::Info => log::info!("{text}"),
        MessageKind::Warning => log::warn!("{text}"),
        MessageKind::Fix => log::info!("fixed: {text}"),
    }
}

/// Report a message, suppressing exact repeats of earlier texts.
pub fn message(kind: MessageKind, text: impl Into<String>) {
    let text = text.into();
    SINK.with(|sink| {
        let mut state = sink.borrow_mut();
        if !state.seen.insert(text.clone()) {
            return;
        }
        emit(kind, &text);
        state.entries.push((kind, text));
    });
}

/// Report a message every time it occurs, bypassing de-duplication.
pub fn message_always(kind: MessageKind, text: impl Into<String>) {
    let text = text.into();
    SINK.with(|sink| {
        let mut state = sink.borrow_mut();
        emit(kind, &text);
        state.seen.insert(text.clone());
        state.entries.push((kind, text));
    });
}

/// Take all recorded messages, clearing the sink. Used by front ends to show
/// a summary, and by tests to assert on reported findings.
pub fn drain() -> Vec<(MessageKind, String)> {
    SINK.with(|sink| {
        let mut state = sink.borrow_mut();
        state.seen.clear();
        std::mem::take(&mut state.entries)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_texts_are_suppressed() {
        drain();
        message(MessageKind::Warning, "wrong head in sector header");
        message(MessageKind::Warning, "wrong head in sector header");
        message(MessageKind::Warning, "mismatched cyl");
        let entries = drain();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn message_always_bypasses_suppression() {
        drain();
        message_always(MessageKind::Fix, "repaired sector");
        message_always(MessageKind::Fix, "repaired sector");
        assert_eq!(drain().len(), 2);
    }
}
