//! Mention resolution for composed text.
//!
//! A mention is `@` followed by a user's exact display name. Names can span
//! several words, so matching walks the directory (longest name first)
//! instead of splitting the text into words.

use uuid::Uuid;

use parley_types::models::User;

use crate::directory::UserDirectory;
use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionScan {
    /// The scanned text, unchanged.
    pub text: String,
    /// Distinct ids in order of first mention.
    pub mentioned_user_ids: Vec<Uuid>,
}

pub fn extract_mentions(text: &str, directory: &UserDirectory) -> MentionScan {
    let mut mentioned_user_ids = Vec::new();
    let mut resume_at = 0;

    for (at, _) in text.match_indices('@') {
        if at < resume_at {
            continue;
        }
        let rest = &text[at + 1..];
        if let Some(user) = directory.longest_match(rest) {
            if !mentioned_user_ids.contains(&user.uid) {
                mentioned_user_ids.push(user.uid);
            }
            resume_at = at + 1 + user.username.len();
        }
    }

    MentionScan {
        text: text.to_string(),
        mentioned_user_ids,
    }
}

/// Text ready to be sent: non-empty, with its mentions resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub mentions: Vec<Uuid>,
}

impl Draft {
    pub fn new(text: &str, directory: &UserDirectory) -> Result<Self, ValidationError> {
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        let scan = extract_mentions(text, directory);
        Ok(Self {
            text: scan.text,
            mentions: scan.mentioned_user_ids,
        })
    }
}

/// Message being composed. Cursor positions are byte offsets into the text.
///
/// Editing helpers only exist here, before sending; [`Composer::finish`]
/// consumes the composer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composer {
    text: String,
    cursor: usize,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing text with the cursor at the end, e.g. when editing.
    pub fn with_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let cursor = text.len();
        Self { text, cursor }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Replace the whole draft, as reported by the input widget.
    pub fn set(&mut self, text: impl Into<String>, cursor: usize) -> Result<(), ValidationError> {
        let text = text.into();
        check_cursor(&text, cursor)?;
        self.text = text;
        self.cursor = cursor;
        Ok(())
    }

    pub fn set_cursor(&mut self, cursor: usize) -> Result<(), ValidationError> {
        check_cursor(&self.text, cursor)?;
        self.cursor = cursor;
        Ok(())
    }

    /// Insert at the cursor (emoji picker, paste) and move past the insertion.
    pub fn insert_text(&mut self, s: &str) {
        self.text.insert_str(self.cursor, s);
        self.cursor += s.len();
    }

    /// Partial name typed after the nearest `@` before the cursor, if the
    /// `@` starts a word and the partial name stays on one line.
    pub fn active_query(&self) -> Option<&str> {
        let before = &self.text[..self.cursor];
        let at = before.rfind('@')?;
        let starts_word = before[..at]
            .chars()
            .next_back()
            .is_none_or(char::is_whitespace);
        let query = &before[at + 1..];
        (starts_word && !query.contains('\n')).then_some(query)
    }

    /// Complete a mention: the text strictly between the nearest `@` before
    /// the cursor and the cursor becomes `Name `.
    pub fn insert_mention(&mut self, user: &User) -> Result<(), ValidationError> {
        let at = self.text[..self.cursor]
            .rfind('@')
            .ok_or(ValidationError::NoMentionTrigger)?;

        let replacement = format!("{} ", user.username);
        self.text.replace_range(at + 1..self.cursor, &replacement);
        self.cursor = at + 1 + replacement.len();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn finish(self, directory: &UserDirectory) -> Result<Draft, ValidationError> {
        Draft::new(&self.text, directory)
    }
}

fn check_cursor(text: &str, cursor: usize) -> Result<(), ValidationError> {
    if text.is_char_boundary(cursor) {
        Ok(())
    } else {
        Err(ValidationError::CursorOutOfRange(cursor))
    }
}
