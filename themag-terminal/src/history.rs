use std::collections::VecDeque;

pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Result of moving the recall cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recall<'a> {
    Entry(&'a str),
    /// Walked past the newest entry: the line goes back to empty.
    Blank,
    Unchanged,
}

/// Submitted lines, oldest first, with a recall cursor.
///
/// The cursor counts back from the newest entry; `None` means the user is
/// editing a fresh line.
#[derive(Clone, Debug)]
pub struct History {
    entries: VecDeque<String>,
    cursor: Option<usize>,
    limit: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl History {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: None,
            limit: limit.max(1),
        }
    }

    /// Records a submitted line and resets the cursor. Blank lines are skipped.
    pub fn push(&mut self, line: &str) {
        self.cursor = None;
        if line.trim().is_empty() {
            return;
        }
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(line.to_string());
    }

    pub fn previous(&mut self) -> Recall<'_> {
        if self.entries.is_empty() {
            return Recall::Unchanged;
        }
        let index = match self.cursor {
            None => 0,
            Some(i) if i + 1 < self.entries.len() => i + 1,
            Some(i) => i,
        };
        self.cursor = Some(index);
        Recall::Entry(self.entry(index))
    }

    pub fn next(&mut self) -> Recall<'_> {
        match self.cursor {
            None => Recall::Unchanged,
            Some(0) => {
                self.cursor = None;
                Recall::Blank
            }
            Some(i) => {
                self.cursor = Some(i - 1);
                Recall::Entry(self.entry(i - 1))
            }
        }
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    fn entry(&self, back: usize) -> &str {
        &self.entries[self.entries.len() - 1 - back]
    }
}
