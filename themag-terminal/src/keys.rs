/// One decoded unit of terminal input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Enter,
    Backspace,
    Up,
    Down,
    /// Ctrl-C
    Interrupt,
    /// Ctrl-L
    ClearScreen,
    /// Printable ASCII.
    Char(char),
    Ignored,
}

/// Splits raw terminal input into keys. Arrow keys arrive as `ESC [ A` and
/// `ESC [ B`; any other escape sequence is skipped.
pub fn decode_keys(data: &str) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut chars = data.chars().peekable();
    while let Some(c) = chars.next() {
        let key = match c {
            '\r' | '\n' => Key::Enter,
            '\x7f' | '\x08' => Key::Backspace,
            '\x03' => Key::Interrupt,
            '\x0c' => Key::ClearScreen,
            '\x1b' => {
                if chars.peek() != Some(&'[') {
                    keys.push(Key::Ignored);
                    continue;
                }
                chars.next();
                match chars.next() {
                    Some('A') => Key::Up,
                    Some('B') => Key::Down,
                    _ => Key::Ignored,
                }
            }
            ' '..='~' => Key::Char(c),
            _ => Key::Ignored,
        };
        keys.push(key);
    }
    keys
}
