use parley_db::FeedError;

/// Rejected input. Always returned before any mutation is attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message text can't be empty")]
    EmptyMessage,

    #[error("channel name can't be empty")]
    EmptyChannelName,

    #[error("a channel named '{0}' already exists")]
    DuplicateChannelName(String),

    #[error("emoji can't be empty")]
    EmptyEmoji,

    #[error("cursor offset {0} is not a character boundary of the draft")]
    CursorOutOfRange(usize),

    #[error("no '@' before the cursor")]
    NoMentionTrigger,

    #[error("no conversation is selected")]
    NoActiveScope,

    #[error("only the author can change this message")]
    NotAuthor,

    #[error("you are not a member of this channel")]
    NotAMember,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Treat a missing document as a valid, empty outcome.
pub(crate) trait NotFoundExt<T> {
    fn found(self) -> SyncResult<Option<T>>;
}

impl<T> NotFoundExt<T> for Result<T, FeedError> {
    fn found(self) -> SyncResult<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(FeedError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
